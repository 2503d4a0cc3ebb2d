//! Fit quality, leave-one-out stability, monotonicity, outliers and weight sensitivity.
//!
//! [`validate`] only reads its inputs. Leave-one-out refits run on the rayon pool once the
//! comparable count reaches the configured threshold.

use super::calibration::ensure_active;
use super::domain::PropertyId;
use super::error::{ValuationError, ValuationResult};
use super::mapping::{
    count_inversions, fit_monotone, FittedCurve, MappingWarning, PriceMapping, PricePoint,
    RegressionFit, RegressionModel, ScoreToPriceMapper,
};
use super::ranking::RankTable;
use super::scoring::score_properties;
use super::stats::{mean, r_squared, std_dev};
use super::weights::WeightProfile;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RESIDUAL_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOptions {
    /// Largest value change (percent) a single weight perturbation may cause before it
    /// is reported as an instability finding.
    pub sensitivity_bound_pct: f64,
    pub perturbation_pct: f64,
    pub loo_parallel_threshold: usize,
    pub outlier_threshold: f64,
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            sensitivity_bound_pct: 5.0,
            perturbation_pct: 10.0,
            loo_parallel_threshold: 16,
            outlier_threshold: 2.0,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LooRefit {
    pub excluded: PropertyId,
    pub model: RegressionModel,
    /// Subject value from the refit without `excluded`.
    pub subject_value: f64,
    /// Refit prediction for the excluded comparable.
    pub predicted_excluded: f64,
    pub observed_excluded: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveOneOut {
    pub refits: Vec<LooRefit>,
    pub r_squared: f64,
    pub subject_min: f64,
    pub subject_max: f64,
    pub spread: f64,
    /// Spread as a percentage of the full-sample point estimate.
    pub spread_pct: Option<f64>,
    pub point_estimate: f64,
    pub contains_point_estimate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonotonicityCheck {
    pub pairs_checked: usize,
    pub inversions: usize,
    pub fallback_used: bool,
    pub model: RegressionModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierFlag {
    pub property: PropertyId,
    pub residual: f64,
    /// Internally studentised residual for linear fits, standardised otherwise.
    pub statistic: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityEntry {
    pub attribute: String,
    /// Signed perturbation applied to the weight, in percent.
    pub perturbation_pct: f64,
    pub base_weight: f64,
    pub perturbed_weight: f64,
    pub subject_score: f64,
    pub score_change: f64,
    pub indicated_value: Option<f64>,
    pub value_change_pct: Option<f64>,
    pub exceeds_bound: bool,
    /// Whether the perturbed weight stays inside its calibrated 10th-90th percentile
    /// band; `None` when the profile carries no bands.
    pub within_calibrated_band: Option<bool>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub model: RegressionModel,
    pub r_squared: f64,
    pub leave_one_out: Option<LeaveOneOut>,
    pub monotonicity: MonotonicityCheck,
    pub outliers: Vec<OutlierFlag>,
    pub sensitivity: Vec<SensitivityEntry>,
    pub sensitivity_bound_pct: f64,
    pub max_value_change_pct: Option<f64>,
    pub instability_findings: Vec<String>,
    pub warnings: Vec<MappingWarning>,
}

pub fn validate(
    table: &RankTable,
    weights: &WeightProfile,
    mapping: &PriceMapping,
    options: &ValidationOptions,
) -> ValuationResult<ValidationReport> {
    let cancel = options.cancel.as_ref();
    ensure_active(cancel)?;

    let points = &mapping.points;
    let fit = match mapping.regression_fit() {
        Some(fit) => fit.clone(),
        None => fit_monotone(points)?,
    };

    let leave_one_out = leave_one_out(points, mapping.subject_score, &fit, options)?;
    let monotonicity = MonotonicityCheck {
        pairs_checked: points.len() * points.len().saturating_sub(1) / 2,
        inversions: count_inversions(points),
        fallback_used: fit.fell_back(),
        model: fit.model(),
    };
    let outliers = outliers(points, &fit, options.outlier_threshold);
    let sensitivity = sensitivity(table, weights, mapping, options)?;

    let max_value_change_pct = sensitivity
        .iter()
        .filter_map(|entry| entry.value_change_pct.map(f64::abs))
        .fold(None, |max: Option<f64>, change| Some(max.map_or(change, |m| m.max(change))));

    let mut instability_findings = Vec::new();
    for entry in sensitivity.iter().filter(|entry| entry.exceeds_bound) {
        instability_findings.push(format!(
            "weight on '{}' perturbed by {:+.0}% moves the indicated value {:+.2}% (bound {:.1}%)",
            entry.attribute,
            entry.perturbation_pct,
            entry.value_change_pct.unwrap_or_default(),
            options.sensitivity_bound_pct
        ));
    }
    if let Some(loo) = &leave_one_out {
        if !loo.contains_point_estimate {
            instability_findings.push(format!(
                "full-sample estimate {:.2} lies outside the leave-one-out range [{:.2}, {:.2}]",
                loo.point_estimate, loo.subject_min, loo.subject_max
            ));
        }
        if let Some(spread_pct) = loo.spread_pct {
            if spread_pct > options.sensitivity_bound_pct * 2.0 {
                instability_findings.push(format!(
                    "leave-one-out subject values spread {spread_pct:.1}% of the point estimate"
                ));
            }
        }
    }
    if monotonicity.inversions > 0 {
        instability_findings.push(format!(
            "{} of {} comparable pairs price against their score order; {} fit used",
            monotonicity.inversions,
            monotonicity.pairs_checked,
            monotonicity.model.label()
        ));
    }
    for outlier in &outliers {
        instability_findings.push(format!(
            "comparable {} residual {:.2} ({:.2} standard errors)",
            outlier.property, outlier.residual, outlier.statistic
        ));
    }

    info!(
        r_squared = fit.r_squared,
        loo_r_squared = leave_one_out.as_ref().map(|loo| loo.r_squared),
        inversions = monotonicity.inversions,
        outliers = outliers.len(),
        findings = instability_findings.len(),
        "validation complete"
    );

    Ok(ValidationReport {
        model: fit.model(),
        r_squared: fit.r_squared,
        leave_one_out,
        monotonicity,
        outliers,
        sensitivity,
        sensitivity_bound_pct: options.sensitivity_bound_pct,
        max_value_change_pct,
        instability_findings,
        warnings: mapping.provenance.warnings.clone(),
    })
}

fn leave_one_out(
    points: &[PricePoint],
    subject_score: f64,
    fit: &RegressionFit,
    options: &ValidationOptions,
) -> ValuationResult<Option<LeaveOneOut>> {
    // each refit needs at least two points
    if points.len() < 3 {
        return Ok(None);
    }

    let cancel = options.cancel.as_ref();
    let refit = |excluded: usize| -> ValuationResult<LooRefit> {
        ensure_active(cancel)?;
        let retained: Vec<PricePoint> = points
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != excluded)
            .map(|(_, point)| point.clone())
            .collect();
        let refit = fit_monotone(&retained)?;
        let left_out = &points[excluded];
        Ok(LooRefit {
            excluded: left_out.property.clone(),
            model: refit.model(),
            subject_value: refit.predict(subject_score).max(0.0),
            predicted_excluded: refit.predict(left_out.score),
            observed_excluded: left_out.price,
        })
    };

    let refits: Vec<LooRefit> = if points.len() >= options.loo_parallel_threshold {
        debug!(refits = points.len(), "running leave-one-out refits in parallel");
        (0..points.len())
            .into_par_iter()
            .map(refit)
            .collect::<ValuationResult<Vec<_>>>()?
    } else {
        (0..points.len())
            .map(refit)
            .collect::<ValuationResult<Vec<_>>>()?
    };

    let observed: Vec<f64> = refits.iter().map(|r| r.observed_excluded).collect();
    let predicted: Vec<f64> = refits.iter().map(|r| r.predicted_excluded).collect();
    let subject_min = refits
        .iter()
        .map(|r| r.subject_value)
        .fold(f64::INFINITY, f64::min);
    let subject_max = refits
        .iter()
        .map(|r| r.subject_value)
        .fold(f64::NEG_INFINITY, f64::max);
    let point_estimate = fit.predict(subject_score).max(0.0);
    let tolerance = RESIDUAL_TOLERANCE * point_estimate.abs().max(1.0);
    let spread = subject_max - subject_min;

    Ok(Some(LeaveOneOut {
        r_squared: r_squared(&observed, &predicted),
        subject_min,
        subject_max,
        spread,
        spread_pct: (point_estimate > 0.0).then(|| spread / point_estimate * 100.0),
        point_estimate,
        contains_point_estimate: point_estimate >= subject_min - tolerance
            && point_estimate <= subject_max + tolerance,
        refits,
    }))
}

fn outliers(points: &[PricePoint], fit: &RegressionFit, threshold: f64) -> Vec<OutlierFlag> {
    let n = points.len();
    if n < 3 {
        return Vec::new();
    }
    let residuals: Vec<f64> = points
        .iter()
        .map(|point| point.price - fit.predict(point.score))
        .collect();
    // residual noise below this is rounding, not misfit
    let floor = RESIDUAL_TOLERANCE
        * points
            .iter()
            .map(|point| point.price.abs())
            .fold(1.0, f64::max);

    let statistics: Vec<f64> = match &fit.curve {
        FittedCurve::Linear { .. } => {
            let scores: Vec<f64> = points.iter().map(|point| point.score).collect();
            let centre = mean(&scores).unwrap_or_default();
            let sxx: f64 = scores.iter().map(|s| (s - centre).powi(2)).sum();
            let sse: f64 = residuals.iter().map(|e| e * e).sum();
            let s = (sse / (n - 2) as f64).sqrt();
            if s <= floor || sxx <= RESIDUAL_TOLERANCE {
                return Vec::new();
            }
            scores
                .iter()
                .zip(&residuals)
                .map(|(score, residual)| {
                    let leverage = 1.0 / n as f64 + (score - centre).powi(2) / sxx;
                    let scale = s * (1.0 - leverage).max(RESIDUAL_TOLERANCE).sqrt();
                    residual / scale
                })
                .collect()
        }
        FittedCurve::Isotonic { .. } | FittedCurve::Flat { .. } => {
            let sigma = std_dev(&residuals).unwrap_or_default();
            if sigma <= floor {
                return Vec::new();
            }
            residuals.iter().map(|residual| residual / sigma).collect()
        }
    };

    points
        .iter()
        .zip(residuals.iter().zip(&statistics))
        .filter(|(_, (_, statistic))| statistic.abs() > threshold)
        .map(|(point, (residual, statistic))| OutlierFlag {
            property: point.property.clone(),
            residual: *residual,
            statistic: *statistic,
        })
        .collect()
}

fn sensitivity(
    table: &RankTable,
    weights: &WeightProfile,
    mapping: &PriceMapping,
    options: &ValidationOptions,
) -> ValuationResult<Vec<SensitivityEntry>> {
    let mapper = ScoreToPriceMapper::new(mapping.settings.clone());
    let base_value = mapping.indicated_value;
    let mut entries = Vec::with_capacity(table.attributes().len() * 2);

    for attribute in table.attributes() {
        let base_weight = weights.weight(attribute).unwrap_or_default();
        for sign in [1.0, -1.0] {
            ensure_active(options.cancel.as_ref())?;
            let perturbation_pct = sign * options.perturbation_pct;
            let perturbed = weights.perturb(attribute, 1.0 + perturbation_pct / 100.0)?;
            let scores = score_properties(table, &perturbed)?;
            let subject_score = scores
                .subject()
                .map(|entry| entry.score)
                .unwrap_or(mapping.subject_score);

            let points: Vec<PricePoint> = mapping
                .points
                .iter()
                .map(|point| PricePoint {
                    property: point.property.clone(),
                    score: scores.score_of(&point.property).unwrap_or(point.score),
                    price: point.price,
                })
                .collect();

            let (indicated_value, note) = match mapper.estimate(&points, subject_score) {
                Ok(estimate) => (Some(estimate.value), None),
                Err(ValuationError::UnbracketedScore { .. }) => (
                    None,
                    Some("perturbed subject score falls outside the comparable range".to_string()),
                ),
                Err(err) => return Err(err),
            };

            let value_change_pct = indicated_value
                .filter(|_| base_value.abs() > RESIDUAL_TOLERANCE)
                .map(|value| (value - base_value) / base_value * 100.0);
            let exceeds_bound =
                value_change_pct.is_some_and(|change| change.abs() > options.sensitivity_bound_pct);
            if exceeds_bound {
                warn!(
                    attribute = attribute.as_str(),
                    perturbation_pct,
                    value_change_pct,
                    "weight perturbation exceeds the sensitivity bound"
                );
            }

            let perturbed_weight = perturbed.weight(attribute).unwrap_or_default();
            let within_calibrated_band = weights
                .bands()
                .and_then(|bands| bands.get(attribute))
                .map(|band| band.contains(perturbed_weight));

            entries.push(SensitivityEntry {
                attribute: attribute.clone(),
                perturbation_pct,
                base_weight,
                perturbed_weight,
                subject_score,
                score_change: subject_score - mapping.subject_score,
                indicated_value,
                value_change_pct,
                exceeds_bound,
                within_calibrated_band,
                note,
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valuation::domain::{MappingMethod, PropertyRole};
    use crate::valuation::mapping::{MappingSettings, PriceBasis};
    use crate::valuation::ranking::RankRow;
    use crate::valuation::weights::{ProfileSource, WeightBand};
    use std::collections::BTreeMap;

    fn row(id: &str, role: PropertyRole, a: f64, b: f64) -> RankRow {
        RankRow {
            property: PropertyId::from(id),
            role,
            values: BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]),
        }
    }

    fn fixture(prices: &[f64]) -> (RankTable, WeightProfile, PriceMapping) {
        let table = RankTable::from_rows(
            vec!["a".to_string(), "b".to_string()],
            vec![
                row("S", PropertyRole::Subject, 2.5, 2.5),
                row("C1", PropertyRole::Comparable, 1.0, 1.0),
                row("C2", PropertyRole::Comparable, 2.0, 2.0),
                row("C3", PropertyRole::Comparable, 3.0, 3.0),
                row("C4", PropertyRole::Comparable, 4.0, 4.0),
                row("C5", PropertyRole::Comparable, 5.0, 5.0),
            ],
        )
        .expect("table");
        let weights = WeightProfile::new(
            "balanced",
            ProfileSource::Custom,
            BTreeMap::from([("a".to_string(), 0.5), ("b".to_string(), 0.5)]),
        )
        .expect("weights");
        let scores = score_properties(&table, &weights).expect("scores");
        let points: Vec<PricePoint> = scores
            .comparables()
            .zip(prices)
            .map(|(entry, price)| PricePoint {
                property: entry.property.clone(),
                score: entry.score,
                price: *price,
            })
            .collect();
        let settings = MappingSettings {
            method: MappingMethod::Regression,
            ..MappingSettings::default()
        };
        let estimate = ScoreToPriceMapper::new(settings.clone())
            .estimate(&points, 2.5)
            .expect("maps");
        let mapping = PriceMapping::new(
            PropertyId::from("S"),
            2.5,
            PriceBasis::Total,
            None,
            points,
            settings,
            estimate,
        );
        (table, weights, mapping)
    }

    #[test]
    fn linear_data_is_stable_under_leave_one_out() {
        let (table, weights, mapping) = fixture(&[100.0, 90.0, 80.0, 70.0, 60.0]);
        let report = validate(&table, &weights, &mapping, &ValidationOptions::default()).expect("report");

        assert!((report.r_squared - 1.0).abs() < 1e-12);
        let loo = report.leave_one_out.expect("loo");
        assert_eq!(loo.refits.len(), 5);
        assert!((loo.r_squared - 1.0).abs() < 1e-9);
        assert!(loo.contains_point_estimate);
        assert!((loo.point_estimate - 85.0).abs() < 1e-9);
        assert_eq!(report.monotonicity.inversions, 0);
        assert!(report.outliers.is_empty());
    }

    #[test]
    fn parallel_and_sequential_refits_agree() {
        let (table, weights, mapping) = fixture(&[100.0, 93.0, 81.0, 72.0, 58.0]);
        let sequential = validate(&table, &weights, &mapping, &ValidationOptions::default()).expect("report");
        let parallel = validate(
            &table,
            &weights,
            &mapping,
            &ValidationOptions {
                loo_parallel_threshold: 1,
                ..ValidationOptions::default()
            },
        )
        .expect("report");
        assert_eq!(sequential.leave_one_out, parallel.leave_one_out);
    }

    #[test]
    fn equal_rank_columns_are_insensitive_to_weight_shifts() {
        let (table, weights, mapping) = fixture(&[100.0, 90.0, 80.0, 70.0, 60.0]);
        let report = validate(&table, &weights, &mapping, &ValidationOptions::default()).expect("report");

        assert_eq!(report.sensitivity.len(), 4);
        assert!(report.sensitivity.iter().all(|entry| !entry.exceeds_bound));
        assert!(report.max_value_change_pct.expect("changes") < 1e-9);
        let first = &report.sensitivity[0];
        assert!((first.perturbed_weight - 0.55).abs() < 1e-12);
    }

    #[test]
    fn perturbations_are_checked_against_calibrated_bands() {
        let (table, weights, mapping) = fixture(&[100.0, 90.0, 80.0, 70.0, 60.0]);
        let unbanded = validate(&table, &weights, &mapping, &ValidationOptions::default()).expect("report");
        assert!(unbanded
            .sensitivity
            .iter()
            .all(|entry| entry.within_calibrated_band.is_none()));

        let banded = weights.with_bands(BTreeMap::from([
            ("a".to_string(), WeightBand { p10: 0.45, p90: 0.54 }),
            ("b".to_string(), WeightBand { p10: 0.40, p90: 0.60 }),
        ]));
        let report = validate(&table, &banded, &mapping, &ValidationOptions::default()).expect("report");
        let band_of = |attribute: &str, sign: f64| {
            report
                .sensitivity
                .iter()
                .find(|entry| entry.attribute == attribute && entry.perturbation_pct * sign > 0.0)
                .and_then(|entry| entry.within_calibrated_band)
        };
        assert_eq!(band_of("a", 1.0), Some(false));
        assert_eq!(band_of("a", -1.0), Some(true));
        assert_eq!(band_of("b", 1.0), Some(true));
        assert_eq!(band_of("b", -1.0), Some(true));
    }

    #[test]
    fn cancelled_validation_stops() {
        let (table, weights, mapping) = fixture(&[100.0, 90.0, 80.0, 70.0, 60.0]);
        let token = CancellationToken::new();
        token.cancel();
        let err = validate(
            &table,
            &weights,
            &mapping,
            &ValidationOptions {
                cancel: Some(token),
                ..ValidationOptions::default()
            },
        )
        .expect_err("cancelled");
        assert_eq!(err, ValuationError::Cancelled);
    }

    #[test]
    fn large_residuals_are_flagged() {
        let points: Vec<PricePoint> = (0..8)
            .map(|index| PricePoint {
                property: PropertyId(format!("C{index}")),
                score: f64::from(index),
                price: 100.0 - 10.0 * f64::from(index) + if index == 4 { 8.0 } else { 0.0 },
            })
            .collect();
        let fit = fit_monotone(&points).expect("fit");
        assert_eq!(fit.model(), RegressionModel::OrdinaryLeastSquares);
        let flags = outliers(&points, &fit, 2.0);
        assert!(flags.iter().any(|flag| flag.property == PropertyId::from("C4")));
    }
}
