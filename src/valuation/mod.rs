//! Ordinal ranking valuation: comparables are ranked attribute by attribute, ranks are
//! combined into weighted composite scores, and the subject's score is mapped onto the
//! comparables' prices.

pub mod calibration;
pub mod domain;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod normalize;
pub mod ranking;
pub mod scoring;
mod stats;
pub mod validation;
pub mod weights;

pub use calibration::{
    calibrate, CalibratedWeights, CalibrationObservation, CalibrationSettings, Outcome,
};
pub use domain::{
    AttributeValue, Confidence, Direction, FinancingTerms, MappingMethod, PropertyId,
    PropertyRecord, PropertyRights, PropertyRole, ScoringMode, TransactionMetadata, Unit,
    VariableSpec,
};
pub use engine::{AnalysisRequest, EngineSettings, ValuationAnalysis, ValuationEngine};
pub use error::{InputError, ValuationError, ValuationResult};
pub use mapping::{
    reconcile, MappingSettings, MappingWarning, PriceBasis, PriceMapping, PricePoint,
    ReconciliationPolicy, RegressionModel, ScoreToPriceMapper,
};
pub use normalize::{normalize_records, ExclusionReason, NormalizationOptions, NormalizedDataset};
pub use ranking::{DistanceMeasure, HybridRankDistance, RankTable, RankingEngine, RankingStrategy};
pub use scoring::{score_properties, CompositeScore, CompositeScores};
pub use tokio_util::sync::CancellationToken;
pub use validation::{validate, ValidationOptions, ValidationReport};
pub use weights::{PropertyTypeProfile, WeightProfile, WeightSelection};
