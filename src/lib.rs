//! Ordinal ranking valuation engine.
//!
//! Ranks a subject property against comparable transactions attribute by attribute,
//! folds the ranks into weighted composite scores and maps the subject's score onto
//! an indicated price, then reports how stable that indication is.

pub mod config;
pub mod error;
pub mod import;
pub mod telemetry;
pub mod valuation;
