use thiserror::Error;

pub type ValuationResult<T> = Result<T, ValuationError>;

/// Violated input invariants. The analysis stops as soon as one is found.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("analysis requires exactly one subject property, found none")]
    MissingSubject,
    #[error("analysis requires exactly one subject property, found {0}")]
    MultipleSubjects(usize),
    #[error("property id '{0}' appears more than once")]
    DuplicateProperty(String),
    #[error("at least {required} usable comparables are required, found {found}")]
    TooFewComparables { required: usize, found: usize },
    #[error("no variables were declared for ranking")]
    NoVariables,
    #[error("variable '{0}' is declared more than once")]
    DuplicateVariable(String),
    #[error("variable '{0}' has no ranking direction")]
    MissingDirection(String),
    #[error("variable '{attribute}' needs at least 2 properties to rank, found {found}")]
    TooFewPropertiesForAttribute { attribute: String, found: usize },
    #[error("property '{property}' has no value for '{attribute}'")]
    MissingValue { property: String, attribute: String },
    #[error("attribute '{attribute}' has no observed values to impute from")]
    NoObservedValues { attribute: String },
    #[error("attribute '{attribute}' mixes units of different dimensions")]
    UnitMismatch { attribute: String },
    #[error("property '{property}' has a non-positive area ({area})")]
    InvalidArea { property: String, area: f64 },
    #[error("annual market trend must be finite and above -100% (found {0})")]
    InvalidMarketTrend(f64),
    #[error("weights must sum to 1.0 (found {sum:.6})")]
    WeightsDoNotSumToOne { sum: f64 },
    #[error("weight for '{attribute}' must be finite and non-negative (found {value})")]
    InvalidWeight { attribute: String, value: f64 },
    #[error("no weight is configured for attribute '{0}'")]
    UncoveredAttribute(String),
    #[error("attribute '{0}' is not part of the weight profile")]
    UnknownAttribute(String),
    #[error("unknown weight profile '{0}'")]
    UnknownProfile(String),
    #[error("reconciliation share must lie in [0, 1] (found {0})")]
    InvalidReconciliationShare(f64),
    #[error("calibration requires at least {required} observations, found {found}")]
    TooFewObservations { required: usize, found: usize },
}

/// Failure modes of a valuation run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValuationError {
    #[error("invalid input: {0}")]
    Input(#[from] InputError),
    #[error(
        "subject score {subject_score:.4} falls outside the comparable score range \
         [{min:.4}, {max:.4}]; switch to regression or allow extrapolation"
    )]
    UnbracketedScore {
        subject_score: f64,
        min: f64,
        max: f64,
    },
    #[error("{method} mapping produced a non-finite value ({value})")]
    NonFiniteValue { method: &'static str, value: f64 },
    #[error("operation cancelled before completion")]
    Cancelled,
}

impl ValuationError {
    pub fn is_input(&self) -> bool {
        matches!(self, ValuationError::Input(_))
    }
}
