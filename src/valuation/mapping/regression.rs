//! Price-on-score regression constrained to a decreasing relationship.
//!
//! Fitting runs as a small state machine:
//!
//! ```text
//! AttemptOls -> CheckMonotonicity -> Done(ols)
//!                      |
//!                      v
//!              FallbackIsotonic -> Done(isotonic)
//!                      |
//!                      v
//!              FallbackRobust -> Done(theil_sen | flat)
//! ```
//!
//! Every transition is appended to the fit path so the substitution is auditable.

use super::PricePoint;
use crate::valuation::error::{InputError, ValuationResult};
use crate::valuation::stats::{mean, median, r_squared};
use serde::{Deserialize, Serialize};
use tracing::warn;

const LEVEL_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionModel {
    OrdinaryLeastSquares,
    Isotonic,
    TheilSen,
    Flat,
}

impl RegressionModel {
    pub const fn label(self) -> &'static str {
        match self {
            Self::OrdinaryLeastSquares => "ordinary least squares",
            Self::Isotonic => "isotonic (monotone decreasing)",
            Self::TheilSen => "Theil-Sen robust slope",
            Self::Flat => "flat median",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "curve", rename_all = "snake_case")]
pub enum FittedCurve {
    Linear {
        model: RegressionModel,
        intercept: f64,
        slope: f64,
    },
    /// Fitted price at each distinct comparable score, ascending by score.
    Isotonic { knots: Vec<(f64, f64)> },
    Flat { level: f64 },
}

impl FittedCurve {
    pub fn model(&self) -> RegressionModel {
        match self {
            Self::Linear { model, .. } => *model,
            Self::Isotonic { .. } => RegressionModel::Isotonic,
            Self::Flat { .. } => RegressionModel::Flat,
        }
    }

    pub fn predict(&self, score: f64) -> f64 {
        match self {
            Self::Linear {
                intercept, slope, ..
            } => intercept + slope * score,
            Self::Isotonic { knots } => predict_isotonic(knots, score),
            Self::Flat { level } => *level,
        }
    }

    pub fn slope(&self) -> Option<f64> {
        match self {
            Self::Linear { slope, .. } => Some(*slope),
            _ => None,
        }
    }
}

fn predict_isotonic(knots: &[(f64, f64)], score: f64) -> f64 {
    let (first, last) = match (knots.first(), knots.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return 0.0,
    };
    if score <= first.0 {
        return first.1;
    }
    if score >= last.0 {
        return last.1;
    }
    for window in knots.windows(2) {
        let (left, right) = (window[0], window[1]);
        if score <= right.0 {
            let span = right.0 - left.0;
            if span <= LEVEL_TOLERANCE {
                return right.1;
            }
            return left.1 + (score - left.0) / span * (right.1 - left.1);
        }
    }
    last.1
}

/// Audit trail of the fit state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum FitStep {
    AttemptedOls { intercept: f64, slope: f64 },
    OlsUndefined,
    MonotonicityPassed,
    MonotonicityFailed { inversions: usize, slope: Option<f64> },
    IsotonicAccepted { levels: usize },
    IsotonicDegenerate,
    TheilSenAccepted { slope: f64 },
    TheilSenRejected { slope: Option<f64> },
    FlatAccepted { level: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonotonicityFinding {
    pub inversions: usize,
    pub ols_slope: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionFit {
    pub curve: FittedCurve,
    pub path: Vec<FitStep>,
    /// Present whenever the OLS fit was rejected and a fallback was used.
    pub violation: Option<MonotonicityFinding>,
    pub r_squared: f64,
    pub observations: usize,
}

impl RegressionFit {
    pub fn predict(&self, score: f64) -> f64 {
        self.curve.predict(score)
    }

    pub fn model(&self) -> RegressionModel {
        self.curve.model()
    }

    pub fn fell_back(&self) -> bool {
        self.violation.is_some()
    }
}

enum FitState {
    AttemptOls,
    CheckMonotonicity(FittedCurve),
    FallbackIsotonic,
    FallbackRobust,
    Done(FittedCurve),
}

/// Fits price against composite score, enforcing that a better (lower) score never
/// maps to a lower price.
pub fn fit_monotone(points: &[PricePoint]) -> ValuationResult<RegressionFit> {
    if points.len() < 2 {
        return Err(InputError::TooFewComparables {
            required: 2,
            found: points.len(),
        }
        .into());
    }

    let inversions = count_inversions(points);
    let mut path = Vec::new();
    let mut violation = None;
    let mut ols_slope = None;
    let mut state = FitState::AttemptOls;

    let curve = loop {
        state = match state {
            FitState::AttemptOls => match ordinary_least_squares(points) {
                Some((intercept, slope)) => {
                    path.push(FitStep::AttemptedOls { intercept, slope });
                    ols_slope = Some(slope);
                    FitState::CheckMonotonicity(FittedCurve::Linear {
                        model: RegressionModel::OrdinaryLeastSquares,
                        intercept,
                        slope,
                    })
                }
                None => {
                    path.push(FitStep::OlsUndefined);
                    violation = Some(MonotonicityFinding {
                        inversions,
                        ols_slope: None,
                    });
                    FitState::FallbackIsotonic
                }
            },
            FitState::CheckMonotonicity(curve) => {
                let decreasing = curve.slope().is_some_and(|slope| slope < 0.0);
                if decreasing && inversions == 0 {
                    path.push(FitStep::MonotonicityPassed);
                    FitState::Done(curve)
                } else {
                    warn!(
                        inversions,
                        slope = ?curve.slope(),
                        "monotonicity violated, falling back to constrained fit"
                    );
                    path.push(FitStep::MonotonicityFailed {
                        inversions,
                        slope: curve.slope(),
                    });
                    violation = Some(MonotonicityFinding {
                        inversions,
                        ols_slope,
                    });
                    FitState::FallbackIsotonic
                }
            }
            FitState::FallbackIsotonic => {
                let knots = isotonic_decreasing(points);
                let levels = distinct_levels(&knots);
                if levels >= 2 {
                    path.push(FitStep::IsotonicAccepted { levels });
                    FitState::Done(FittedCurve::Isotonic { knots })
                } else {
                    path.push(FitStep::IsotonicDegenerate);
                    FitState::FallbackRobust
                }
            }
            FitState::FallbackRobust => match theil_sen(points) {
                Some((intercept, slope)) if slope < 0.0 => {
                    path.push(FitStep::TheilSenAccepted { slope });
                    FitState::Done(FittedCurve::Linear {
                        model: RegressionModel::TheilSen,
                        intercept,
                        slope,
                    })
                }
                other => {
                    path.push(FitStep::TheilSenRejected {
                        slope: other.map(|(_, slope)| slope),
                    });
                    let prices: Vec<f64> = points.iter().map(|point| point.price).collect();
                    let level = median(&prices).unwrap_or_default();
                    warn!(level, "no monotone relationship between score and price");
                    path.push(FitStep::FlatAccepted { level });
                    FitState::Done(FittedCurve::Flat { level })
                }
            },
            FitState::Done(curve) => break curve,
        };
    };

    let observed: Vec<f64> = points.iter().map(|point| point.price).collect();
    let predicted: Vec<f64> = points.iter().map(|point| curve.predict(point.score)).collect();

    Ok(RegressionFit {
        r_squared: r_squared(&observed, &predicted),
        curve,
        path,
        violation,
        observations: points.len(),
    })
}

/// Pairs where the better-scored comparable sold for less. Tied scores are skipped.
pub fn count_inversions(points: &[PricePoint]) -> usize {
    let mut inversions = 0;
    for (index, left) in points.iter().enumerate() {
        for right in &points[index + 1..] {
            let score_gap = right.score - left.score;
            if score_gap.abs() < LEVEL_TOLERANCE {
                continue;
            }
            let price_gap = right.price - left.price;
            if score_gap * price_gap > 0.0 {
                inversions += 1;
            }
        }
    }
    inversions
}

pub(crate) fn ordinary_least_squares(points: &[PricePoint]) -> Option<(f64, f64)> {
    let scores: Vec<f64> = points.iter().map(|point| point.score).collect();
    let prices: Vec<f64> = points.iter().map(|point| point.price).collect();
    let score_mean = mean(&scores)?;
    let price_mean = mean(&prices)?;

    let sxx: f64 = scores.iter().map(|s| (s - score_mean).powi(2)).sum();
    if sxx <= LEVEL_TOLERANCE {
        return None;
    }
    let sxy: f64 = scores
        .iter()
        .zip(&prices)
        .map(|(s, p)| (s - score_mean) * (p - price_mean))
        .sum();
    let slope = sxy / sxx;
    Some((price_mean - slope * score_mean, slope))
}

/// Pool-adjacent-violators for a non-increasing fit, one knot per distinct score.
fn isotonic_decreasing(points: &[PricePoint]) -> Vec<(f64, f64)> {
    let mut sorted: Vec<&PricePoint> = points.iter().collect();
    sorted.sort_by(|a, b| a.score.total_cmp(&b.score));

    // (score, price sum, count) per distinct score
    let mut distinct: Vec<(f64, f64, usize)> = Vec::new();
    for point in sorted {
        match distinct.last_mut() {
            Some((score, sum, count)) if (point.score - *score).abs() < LEVEL_TOLERANCE => {
                *sum += point.price;
                *count += 1;
            }
            _ => distinct.push((point.score, point.price, 1)),
        }
    }

    // blocks: (mean, weight, number of distinct scores covered)
    let mut blocks: Vec<(f64, f64, usize)> = Vec::new();
    for (_, sum, count) in &distinct {
        blocks.push((sum / *count as f64, *count as f64, 1));
        while blocks.len() >= 2 {
            let last = blocks[blocks.len() - 1];
            let previous = blocks[blocks.len() - 2];
            if previous.0 >= last.0 - LEVEL_TOLERANCE {
                break;
            }
            let weight = previous.1 + last.1;
            let merged = (
                (previous.0 * previous.1 + last.0 * last.1) / weight,
                weight,
                previous.2 + last.2,
            );
            blocks.pop();
            blocks.pop();
            blocks.push(merged);
        }
    }

    let mut knots = Vec::with_capacity(distinct.len());
    let mut scores = distinct.iter().map(|(score, _, _)| *score);
    for (level, _, span) in blocks {
        for score in scores.by_ref().take(span) {
            knots.push((score, level));
        }
    }
    knots
}

fn distinct_levels(knots: &[(f64, f64)]) -> usize {
    let mut levels = 0;
    let mut previous: Option<f64> = None;
    for (_, level) in knots {
        if previous.map_or(true, |value| (value - level).abs() > LEVEL_TOLERANCE) {
            levels += 1;
        }
        previous = Some(*level);
    }
    levels
}

/// Median pairwise slope with a median-residual intercept.
fn theil_sen(points: &[PricePoint]) -> Option<(f64, f64)> {
    let mut slopes = Vec::new();
    for (index, left) in points.iter().enumerate() {
        for right in &points[index + 1..] {
            let run = right.score - left.score;
            if run.abs() > LEVEL_TOLERANCE {
                slopes.push((right.price - left.price) / run);
            }
        }
    }
    let slope = median(&slopes)?;
    let offsets: Vec<f64> = points
        .iter()
        .map(|point| point.price - slope * point.score)
        .collect();
    Some((median(&offsets)?, slope))
}
