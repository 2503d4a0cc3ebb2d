//! Weight calibration against historical outcomes.
//!
//! The search walks the weight simplex by moving small amounts of weight between
//! pairs of attributes, keeping any move that lowers the leave-one-out squared
//! error of a linear outcome-on-score fit. No weight may drift further from the
//! prior than the configured guardrail. Bootstrap replicates of the same search
//! give the 10th-90th percentile band for each weight. Replicates are seeded from
//! the caller's seed, so identical inputs always yield the identical artifact.

use super::error::{InputError, ValuationError, ValuationResult};
use super::stats::{mean, percentile};
use super::weights::{ProfileSource, WeightBand, WeightProfile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const MIN_CALIBRATION_OBSERVATIONS: usize = 5;

/// Checked between independent iterations of long-running work.
pub(crate) fn ensure_active(cancel: Option<&CancellationToken>) -> ValuationResult<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(ValuationError::Cancelled),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    SalePrice(f64),
    Won(bool),
}

impl Outcome {
    pub fn value(self) -> f64 {
        match self {
            Self::SalePrice(price) => price,
            Self::Won(true) => 1.0,
            Self::Won(false) => 0.0,
        }
    }
}

/// One historical property: its attribute ranks within its own market set and what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationObservation {
    pub ranks: BTreeMap<String, f64>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Version stamped on the produced artifact.
    pub version: u32,
    /// Maximum distance, in percentage points, any weight may move from the prior.
    pub max_shift_pct_points: f64,
    pub bootstrap_samples: usize,
    pub seed: u64,
    pub max_iterations: usize,
    pub initial_step: f64,
    pub min_step: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            version: 1,
            max_shift_pct_points: 5.0,
            bootstrap_samples: 200,
            seed: 0x5EED,
            max_iterations: 60,
            initial_step: 0.02,
            min_step: 0.0025,
        }
    }
}

/// Versioned calibration artifact. Produced here, stored and adopted elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedWeights {
    pub version: u32,
    pub prior_profile: String,
    pub weights: BTreeMap<String, f64>,
    pub bands: BTreeMap<String, WeightBand>,
    pub prior_weights: BTreeMap<String, f64>,
    pub observations: usize,
    pub bootstrap_samples: usize,
    pub seed: u64,
    pub max_shift_pct_points: f64,
    pub prior_cv_error: f64,
    pub calibrated_cv_error: f64,
}

impl CalibratedWeights {
    pub fn to_profile(&self) -> ValuationResult<WeightProfile> {
        let profile = WeightProfile::from_unnormalized(
            &format!("{}-calibrated-v{}", self.prior_profile, self.version),
            ProfileSource::Calibrated {
                version: self.version,
            },
            self.weights.clone(),
        )?;
        Ok(profile.with_bands(self.bands.clone()))
    }
}

struct Problem<'a> {
    attributes: Vec<String>,
    prior: Vec<f64>,
    history: &'a [CalibrationObservation],
    max_shift: f64,
}

impl Problem<'_> {
    fn rows(&self, indices: &[usize]) -> (Vec<Vec<f64>>, Vec<f64>) {
        indices
            .iter()
            .map(|index| {
                let observation = &self.history[*index];
                let ranks = self
                    .attributes
                    .iter()
                    .map(|attribute| observation.ranks.get(attribute).copied().unwrap_or_default())
                    .collect();
                (ranks, observation.outcome.value())
            })
            .unzip()
    }

    fn within_guardrail(&self, candidate: &[f64]) -> bool {
        candidate
            .iter()
            .zip(&self.prior)
            .all(|(weight, prior)| *weight >= 0.0 && (weight - prior).abs() <= self.max_shift + 1e-12)
    }

    fn search(
        &self,
        indices: &[usize],
        settings: &CalibrationSettings,
        cancel: Option<&CancellationToken>,
    ) -> ValuationResult<(Vec<f64>, f64)> {
        let (ranks, outcomes) = self.rows(indices);
        let mut weights = self.prior.clone();
        let mut best = loo_error(&ranks, &outcomes, &weights);
        let mut step = settings.initial_step;
        let k = weights.len();

        for _ in 0..settings.max_iterations {
            ensure_active(cancel)?;
            let mut improved = false;

            for gain in 0..k {
                for loss in 0..k {
                    if gain == loss {
                        continue;
                    }
                    let mut candidate = weights.clone();
                    candidate[gain] += step;
                    candidate[loss] -= step;
                    if !self.within_guardrail(&candidate) {
                        continue;
                    }
                    let error = loo_error(&ranks, &outcomes, &candidate);
                    if error < best - 1e-12 {
                        weights = candidate;
                        best = error;
                        improved = true;
                    }
                }
            }

            if !improved {
                step /= 2.0;
                if step < settings.min_step {
                    break;
                }
            }
        }

        Ok((weights, best))
    }
}

/// Fits weights to `history`, starting from and bounded around `prior`.
pub fn calibrate(
    prior: &WeightProfile,
    history: &[CalibrationObservation],
    settings: &CalibrationSettings,
    cancel: Option<&CancellationToken>,
) -> ValuationResult<CalibratedWeights> {
    if history.len() < MIN_CALIBRATION_OBSERVATIONS {
        return Err(InputError::TooFewObservations {
            required: MIN_CALIBRATION_OBSERVATIONS,
            found: history.len(),
        }
        .into());
    }
    prior.validate()?;

    let attributes: Vec<String> = prior.weights().keys().cloned().collect();
    for observation in history {
        for attribute in &attributes {
            if !observation.ranks.contains_key(attribute) {
                return Err(InputError::UncoveredAttribute(attribute.clone()).into());
            }
        }
    }

    let problem = Problem {
        prior: attributes
            .iter()
            .map(|attribute| prior.weight(attribute).unwrap_or_default())
            .collect(),
        attributes,
        history,
        max_shift: settings.max_shift_pct_points.max(0.0) / 100.0,
    };

    let everything: Vec<usize> = (0..history.len()).collect();
    let (ranks, outcomes) = problem.rows(&everything);
    let prior_cv_error = loo_error(&ranks, &outcomes, &problem.prior);
    let (point, calibrated_cv_error) = problem.search(&everything, settings, cancel)?;

    let replicates = (0..settings.bootstrap_samples)
        .into_par_iter()
        .map(|replicate| {
            ensure_active(cancel)?;
            let mut rng = StdRng::seed_from_u64(replicate_seed(settings.seed, replicate));
            let sample: Vec<usize> = (0..history.len())
                .map(|_| rng.gen_range(0..history.len()))
                .collect();
            problem
                .search(&sample, settings, cancel)
                .map(|(weights, _)| weights)
        })
        .collect::<ValuationResult<Vec<Vec<f64>>>>()?;

    let bands = problem
        .attributes
        .iter()
        .enumerate()
        .map(|(index, attribute)| {
            let draws: Vec<f64> = replicates.iter().map(|weights| weights[index]).collect();
            let band = WeightBand {
                p10: percentile(&draws, 10.0).unwrap_or(point[index]),
                p90: percentile(&draws, 90.0).unwrap_or(point[index]),
            };
            (attribute.clone(), band)
        })
        .collect();

    info!(
        profile = prior.name(),
        observations = history.len(),
        prior_cv_error,
        calibrated_cv_error,
        "weights calibrated"
    );

    Ok(CalibratedWeights {
        version: settings.version,
        prior_profile: prior.name().to_string(),
        weights: problem
            .attributes
            .iter()
            .cloned()
            .zip(point.iter().copied())
            .collect(),
        bands,
        prior_weights: prior.weights().clone(),
        observations: history.len(),
        bootstrap_samples: settings.bootstrap_samples,
        seed: settings.seed,
        max_shift_pct_points: settings.max_shift_pct_points,
        prior_cv_error,
        calibrated_cv_error,
    })
}

fn replicate_seed(seed: u64, replicate: usize) -> u64 {
    seed ^ (replicate as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Mean squared leave-one-out error of `outcome ~ a + b * score`.
///
/// Uses the closed-form hat-matrix shortcut, so no refits are needed.
fn loo_error(ranks: &[Vec<f64>], outcomes: &[f64], weights: &[f64]) -> f64 {
    let n = outcomes.len();
    if n < 3 {
        return f64::INFINITY;
    }
    let scores: Vec<f64> = ranks
        .iter()
        .map(|row| row.iter().zip(weights).map(|(rank, weight)| rank * weight).sum())
        .collect();

    let score_mean = mean(&scores).unwrap_or_default();
    let outcome_mean = mean(outcomes).unwrap_or_default();
    let sxx: f64 = scores.iter().map(|s| (s - score_mean).powi(2)).sum();

    if sxx <= f64::EPSILON {
        let inflation = n as f64 / (n as f64 - 1.0);
        return outcomes
            .iter()
            .map(|y| ((y - outcome_mean) * inflation).powi(2))
            .sum::<f64>()
            / n as f64;
    }

    let sxy: f64 = scores
        .iter()
        .zip(outcomes)
        .map(|(s, y)| (s - score_mean) * (y - outcome_mean))
        .sum();
    let slope = sxy / sxx;
    let intercept = outcome_mean - slope * score_mean;

    scores
        .iter()
        .zip(outcomes)
        .map(|(s, y)| {
            let leverage = 1.0 / n as f64 + (s - score_mean).powi(2) / sxx;
            let residual = y - (intercept + slope * s);
            let denominator = (1.0 - leverage).max(1e-9);
            (residual / denominator).powi(2)
        })
        .sum::<f64>()
        / n as f64
}
