//! Score-to-price mapping: interpolation between bracketing comparables, a monotone
//! regression of price on score, and a disclosed reconciliation of the two.

pub mod interpolation;
pub mod regression;

pub use interpolation::{interpolate, Bracket, InterpolationEstimate};
pub use regression::{
    count_inversions, fit_monotone, FitStep, FittedCurve, MonotonicityFinding, RegressionFit,
    RegressionModel,
};

use super::domain::{Confidence, MappingMethod, PropertyId};
use super::error::{InputError, ValuationError, ValuationResult};
use super::normalize::MIN_COMPARABLES;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Below this many comparables interpolation is preferred and regression is supplementary.
pub const DEFAULT_INTERPOLATION_MAX_COMPARABLES: usize = 7;

const HIGH_CONFIDENCE_R_SQUARED: f64 = 0.75;

/// One comparable on the score/price plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub property: PropertyId,
    pub score: f64,
    pub price: f64,
}

/// What the mapped price measures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriceBasis {
    PerUnitArea { area_attribute: String },
    Total,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconciliationPolicy {
    /// Blend in proportion to confidence level (low 1, medium 2, high 3).
    #[default]
    ConfidenceWeighted,
    /// Caller-chosen share for the interpolation estimate; regression gets the rest.
    Fixed { interpolation_share: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSettings {
    pub method: MappingMethod,
    pub allow_extrapolation: bool,
    pub reconciliation: ReconciliationPolicy,
    pub interpolation_max_comparables: usize,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            method: MappingMethod::Both,
            allow_extrapolation: false,
            reconciliation: ReconciliationPolicy::ConfidenceWeighted,
            interpolation_max_comparables: DEFAULT_INTERPOLATION_MAX_COMPARABLES,
        }
    }
}

impl MappingSettings {
    fn validate(&self) -> ValuationResult<()> {
        if let ReconciliationPolicy::Fixed {
            interpolation_share,
        } = self.reconciliation
        {
            if !(0.0..=1.0).contains(&interpolation_share) {
                return Err(InputError::InvalidReconciliationShare(interpolation_share).into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionEstimate {
    pub value: f64,
    pub confidence: Confidence,
    pub fit: RegressionFit,
    /// Set when the comparable count is below the interpolation threshold.
    pub supplementary: bool,
}

/// Disclosed blend of the interpolation and regression estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub interpolation_weight: f64,
    pub regression_weight: f64,
    pub value: f64,
    pub rationale: String,
}

/// Recoverable conditions met while mapping. Each one is disclosed in the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingWarning {
    MonotonicityViolation {
        inversions: usize,
        ols_slope: Option<f64>,
        fallback: RegressionModel,
    },
    InsufficientDataForRegression {
        comparables: usize,
        recommended: usize,
    },
    UnbracketedScore {
        subject_score: f64,
        min: f64,
        max: f64,
    },
    Extrapolated,
    NoMonotoneRelationship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingProvenance {
    pub requested: MappingMethod,
    pub methods_used: Vec<MappingMethod>,
    pub interpolation: Option<InterpolationEstimate>,
    pub regression: Option<RegressionEstimate>,
    pub reconciliation: Option<Reconciliation>,
    pub warnings: Vec<MappingWarning>,
    /// Why the methods used differ from the method requested.
    pub substitution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEstimate {
    pub value: f64,
    pub confidence: Confidence,
    pub provenance: MappingProvenance,
}

/// Final mapping for the subject, in the chosen price basis plus the total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceMapping {
    pub subject: PropertyId,
    pub subject_score: f64,
    pub basis: PriceBasis,
    pub subject_area: Option<f64>,
    /// Indicated value in the price basis.
    pub indicated_value: f64,
    pub indicated_price_per_unit: Option<f64>,
    pub indicated_total_price: f64,
    pub confidence: Confidence,
    pub provenance: MappingProvenance,
    pub points: Vec<PricePoint>,
    pub settings: MappingSettings,
}

impl PriceMapping {
    pub fn new(
        subject: PropertyId,
        subject_score: f64,
        basis: PriceBasis,
        subject_area: Option<f64>,
        points: Vec<PricePoint>,
        settings: MappingSettings,
        estimate: MappingEstimate,
    ) -> Self {
        let (per_unit, total) = match (&basis, subject_area) {
            (PriceBasis::PerUnitArea { .. }, Some(area)) => {
                (Some(estimate.value), estimate.value * area)
            }
            _ => (None, estimate.value),
        };
        Self {
            subject,
            subject_score,
            basis,
            subject_area,
            indicated_value: estimate.value,
            indicated_price_per_unit: per_unit,
            indicated_total_price: total,
            confidence: estimate.confidence,
            provenance: estimate.provenance,
            points,
            settings,
        }
    }

    pub fn regression_fit(&self) -> Option<&RegressionFit> {
        self.provenance.regression.as_ref().map(|estimate| &estimate.fit)
    }
}

/// Blends the two estimates with explicit weights.
///
/// When their confidence levels are more than one step apart only the more confident
/// estimate is used, and the rationale says so.
pub fn reconcile(
    interpolation: &InterpolationEstimate,
    regression: &RegressionEstimate,
    policy: ReconciliationPolicy,
) -> ValuationResult<Reconciliation> {
    let interpolation_level = f64::from(interpolation.confidence.level());
    let regression_level = f64::from(regression.confidence.level());

    let (interpolation_weight, rationale) = if (interpolation_level - regression_level).abs() > 1.0
    {
        if interpolation_level > regression_level {
            (
                1.0,
                format!(
                    "interpolation ({}) used alone; regression ({}) not comparably confident",
                    interpolation.confidence.label(),
                    regression.confidence.label()
                ),
            )
        } else {
            (
                0.0,
                format!(
                    "regression ({}) used alone; interpolation ({}) not comparably confident",
                    regression.confidence.label(),
                    interpolation.confidence.label()
                ),
            )
        }
    } else {
        match policy {
            ReconciliationPolicy::ConfidenceWeighted => (
                interpolation_level / (interpolation_level + regression_level),
                format!(
                    "confidence-weighted blend: interpolation {} vs regression {}",
                    interpolation.confidence.label(),
                    regression.confidence.label()
                ),
            ),
            ReconciliationPolicy::Fixed {
                interpolation_share,
            } => {
                if !(0.0..=1.0).contains(&interpolation_share) {
                    return Err(InputError::InvalidReconciliationShare(interpolation_share).into());
                }
                (
                    interpolation_share,
                    format!("fixed blend: {:.0}% interpolation", interpolation_share * 100.0),
                )
            }
        }
    };

    let regression_weight = 1.0 - interpolation_weight;
    Ok(Reconciliation {
        interpolation_weight,
        regression_weight,
        value: interpolation_weight * interpolation.value + regression_weight * regression.value,
        rationale,
    })
}

/// Maps a composite score to an indicated value using the configured method(s).
#[derive(Debug, Clone, Default)]
pub struct ScoreToPriceMapper {
    settings: MappingSettings,
}

impl ScoreToPriceMapper {
    pub fn new(settings: MappingSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MappingSettings {
        &self.settings
    }

    pub fn regression(&self, points: &[PricePoint], subject_score: f64) -> ValuationResult<RegressionEstimate> {
        let fit = fit_monotone(points)?;
        let supplementary = points.len() < self.settings.interpolation_max_comparables;
        let confidence = if supplementary {
            Confidence::Low
        } else {
            match fit.model() {
                RegressionModel::OrdinaryLeastSquares if fit.r_squared >= HIGH_CONFIDENCE_R_SQUARED => {
                    Confidence::High
                }
                RegressionModel::Flat => Confidence::Low,
                _ => Confidence::Medium,
            }
        };
        Ok(RegressionEstimate {
            value: fit.predict(subject_score).max(0.0),
            confidence,
            fit,
            supplementary,
        })
    }

    pub fn estimate(&self, points: &[PricePoint], subject_score: f64) -> ValuationResult<MappingEstimate> {
        self.settings.validate()?;
        if points.len() < MIN_COMPARABLES {
            return Err(InputError::TooFewComparables {
                required: MIN_COMPARABLES,
                found: points.len(),
            }
            .into());
        }

        let requested = self.settings.method;
        let mut warnings = Vec::new();
        let mut substitution = None;

        let interpolation = match requested {
            MappingMethod::Regression => None,
            MappingMethod::Interpolation => Some(self.interpolation(points, subject_score)?),
            MappingMethod::Both => match self.interpolation(points, subject_score) {
                Ok(estimate) => Some(estimate),
                Err(ValuationError::UnbracketedScore {
                    subject_score,
                    min,
                    max,
                }) => {
                    warn!(subject_score, min, max, "subject score unbracketed, using regression alone");
                    warnings.push(MappingWarning::UnbracketedScore {
                        subject_score,
                        min,
                        max,
                    });
                    substitution = Some(format!(
                        "interpolation unavailable: subject score {subject_score:.4} outside \
                         [{min:.4}, {max:.4}]; regression used alone"
                    ));
                    None
                }
                Err(err) => return Err(err),
            },
        };

        let regression = match requested {
            MappingMethod::Interpolation => None,
            MappingMethod::Regression | MappingMethod::Both => {
                Some(self.regression(points, subject_score)?)
            }
        };

        if interpolation.as_ref().is_some_and(|estimate| estimate.extrapolated) {
            warnings.push(MappingWarning::Extrapolated);
        }
        if let Some(estimate) = &regression {
            if let Some(finding) = &estimate.fit.violation {
                warnings.push(MappingWarning::MonotonicityViolation {
                    inversions: finding.inversions,
                    ols_slope: finding.ols_slope,
                    fallback: estimate.fit.model(),
                });
            }
            if estimate.fit.model() == RegressionModel::Flat {
                warnings.push(MappingWarning::NoMonotoneRelationship);
            }
            if estimate.supplementary {
                warnings.push(MappingWarning::InsufficientDataForRegression {
                    comparables: points.len(),
                    recommended: self.settings.interpolation_max_comparables,
                });
            }
        }

        let (value, confidence, methods_used, reconciliation) = match (&interpolation, &regression) {
            (Some(interp), Some(regr)) => {
                let blend = reconcile(interp, regr, self.settings.reconciliation)?;
                let mut used = Vec::with_capacity(2);
                if blend.interpolation_weight > 0.0 {
                    used.push(MappingMethod::Interpolation);
                }
                if blend.regression_weight > 0.0 {
                    used.push(MappingMethod::Regression);
                }
                let confidence = match (blend.interpolation_weight > 0.0, blend.regression_weight > 0.0) {
                    (true, false) => interp.confidence,
                    (false, true) => regr.confidence,
                    _ => interp.confidence.min(regr.confidence),
                };
                (blend.value, confidence, used, Some(blend))
            }
            (Some(interp), None) => (
                interp.value,
                interp.confidence,
                vec![MappingMethod::Interpolation],
                None,
            ),
            (None, Some(regr)) => (
                regr.value,
                regr.confidence,
                vec![MappingMethod::Regression],
                None,
            ),
            (None, None) => {
                return Err(InputError::TooFewComparables {
                    required: MIN_COMPARABLES,
                    found: points.len(),
                }
                .into())
            }
        };

        if !value.is_finite() {
            return Err(ValuationError::NonFiniteValue {
                method: requested.label(),
                value,
            });
        }
        debug!(value, confidence = confidence.label(), methods = ?methods_used, "score mapped to price");

        Ok(MappingEstimate {
            value,
            confidence,
            provenance: MappingProvenance {
                requested,
                methods_used,
                interpolation,
                regression,
                reconciliation,
                warnings,
                substitution,
            },
        })
    }

    fn interpolation(&self, points: &[PricePoint], subject_score: f64) -> ValuationResult<InterpolationEstimate> {
        interpolate(
            points,
            subject_score,
            self.settings.allow_extrapolation,
            self.settings.interpolation_max_comparables,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(pairs: &[(f64, f64)]) -> Vec<PricePoint> {
        pairs
            .iter()
            .enumerate()
            .map(|(index, (score, price))| PricePoint {
                property: PropertyId(format!("C{}", index + 1)),
                score: *score,
                price: *price,
            })
            .collect()
    }

    fn mapper(method: MappingMethod) -> ScoreToPriceMapper {
        ScoreToPriceMapper::new(MappingSettings {
            method,
            ..MappingSettings::default()
        })
    }

    #[test]
    fn non_finite_values_are_never_returned() {
        let data = points(&[(1.1, 100.0), (2.0, f64::NAN), (3.0, 80.0)]);
        let err = mapper(MappingMethod::Interpolation)
            .estimate(&data, 1.5)
            .expect_err("nan price");
        assert!(matches!(
            err,
            ValuationError::NonFiniteValue {
                method: "interpolation",
                ..
            }
        ));
    }

    #[test]
    fn small_samples_prefer_interpolation_and_mark_regression_supplementary() {
        let data = points(&[(1.1, 100.0), (2.0, 90.0), (3.0, 80.0)]);
        let estimate = mapper(MappingMethod::Both).estimate(&data, 1.5).expect("maps");

        assert_eq!(estimate.provenance.methods_used, vec![MappingMethod::Interpolation]);
        assert_eq!(estimate.confidence, Confidence::High);
        let regression = estimate.provenance.regression.as_ref().expect("regression computed");
        assert!(regression.supplementary);
        assert_eq!(regression.confidence, Confidence::Low);
        assert!(estimate
            .provenance
            .warnings
            .iter()
            .any(|w| matches!(w, MappingWarning::InsufficientDataForRegression { comparables: 3, .. })));
        let blend = estimate.provenance.reconciliation.as_ref().expect("disclosed");
        assert_eq!(blend.interpolation_weight, 1.0);
    }

    #[test]
    fn unbracketed_subject_substitutes_regression_and_says_so() {
        let data = points(&[(1.0, 100.0), (2.0, 90.0), (3.0, 80.0)]);
        let estimate = mapper(MappingMethod::Both).estimate(&data, 0.5).expect("maps");

        assert_eq!(estimate.provenance.methods_used, vec![MappingMethod::Regression]);
        assert!(estimate.provenance.substitution.is_some());
        assert!((estimate.value - 105.0).abs() < 1e-9);

        let err = mapper(MappingMethod::Interpolation)
            .estimate(&data, 0.5)
            .expect_err("interpolation only");
        assert!(matches!(err, ValuationError::UnbracketedScore { .. }));
    }

    #[test]
    fn inverted_prices_trigger_the_monotone_fallback() {
        let data = points(&[(1.0, 100.0), (2.0, 80.0), (3.0, 90.0), (4.0, 70.0)]);
        let estimate = mapper(MappingMethod::Regression).estimate(&data, 2.5).expect("maps");
        let regression = estimate.provenance.regression.as_ref().expect("regression");
        assert_ne!(regression.fit.model(), RegressionModel::OrdinaryLeastSquares);
        assert!(estimate
            .provenance
            .warnings
            .iter()
            .any(|w| matches!(w, MappingWarning::MonotonicityViolation { inversions: 1, .. })));
    }

    #[test]
    fn confidence_weighted_blend_discloses_its_weights() {
        let interpolation = interpolate(&points(&[(1.0, 100.0), (3.0, 80.0), (5.0, 60.0)]), 2.0, false, 2)
            .expect("bracketed");
        assert_eq!(interpolation.confidence, Confidence::Medium);
        let regression = RegressionEstimate {
            value: 88.0,
            confidence: Confidence::High,
            fit: fit_monotone(&points(&[(1.0, 100.0), (3.0, 80.0), (5.0, 60.0)])).expect("fit"),
            supplementary: false,
        };

        let blend = reconcile(&interpolation, &regression, ReconciliationPolicy::ConfidenceWeighted)
            .expect("blend");
        assert!((blend.interpolation_weight - 0.4).abs() < 1e-12);
        assert!((blend.value - (0.4 * 90.0 + 0.6 * 88.0)).abs() < 1e-9);

        let fixed = reconcile(
            &interpolation,
            &regression,
            ReconciliationPolicy::Fixed {
                interpolation_share: 0.25,
            },
        )
        .expect("fixed");
        assert!((fixed.regression_weight - 0.75).abs() < 1e-12);
    }

    #[test]
    fn fewer_than_three_points_is_an_input_error() {
        let err = mapper(MappingMethod::Both)
            .estimate(&points(&[(1.0, 100.0), (2.0, 90.0)]), 1.5)
            .expect_err("too few");
        assert!(err.is_input());
    }
}
