use super::PricePoint;
use crate::valuation::domain::{Confidence, PropertyId};
use crate::valuation::error::{InputError, ValuationError, ValuationResult};
use crate::valuation::normalize::MIN_COMPARABLES;
use serde::{Deserialize, Serialize};

const SCORE_TOLERANCE: f64 = 1e-9;

/// Comparables sharing one composite score on either side of the subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    pub properties: Vec<PropertyId>,
    pub score: f64,
    /// Mean price of the comparables at this score.
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolationEstimate {
    pub value: f64,
    pub confidence: Confidence,
    pub lower: Bracket,
    pub upper: Bracket,
    pub extrapolated: bool,
}

fn groups(points: &[PricePoint]) -> Vec<Bracket> {
    let mut sorted: Vec<&PricePoint> = points.iter().collect();
    sorted.sort_by(|a, b| a.score.total_cmp(&b.score));

    let mut groups: Vec<(Vec<PropertyId>, f64, Vec<f64>)> = Vec::new();
    for point in sorted {
        match groups.last_mut() {
            Some((ids, score, prices)) if (point.score - *score).abs() < SCORE_TOLERANCE => {
                ids.push(point.property.clone());
                prices.push(point.price);
            }
            _ => groups.push((vec![point.property.clone()], point.score, vec![point.price])),
        }
    }

    groups
        .into_iter()
        .map(|(properties, score, prices)| Bracket {
            properties,
            score,
            price: prices.iter().sum::<f64>() / prices.len() as f64,
        })
        .collect()
}

fn along(lower: &Bracket, upper: &Bracket, score: f64) -> f64 {
    let span = upper.score - lower.score;
    if span.abs() < SCORE_TOLERANCE {
        return (lower.price + upper.price) / 2.0;
    }
    let position = (score - lower.score) / span;
    lower.price + position * (upper.price - lower.price)
}

/// Linear interpolation of price between the comparables bracketing `subject_score`.
///
/// Outside the observed score range this fails with
/// [`ValuationError::UnbracketedScore`] unless `allow_extrapolation` is set, in which
/// case the nearest segment is extended and the estimate is marked low confidence.
pub fn interpolate(
    points: &[PricePoint],
    subject_score: f64,
    allow_extrapolation: bool,
    preferred_below: usize,
) -> ValuationResult<InterpolationEstimate> {
    let groups = groups(points);
    let (first, last) = match (groups.first(), groups.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(InputError::TooFewComparables {
                required: MIN_COMPARABLES,
                found: 0,
            }
            .into())
        }
    };

    let within = subject_score >= first.score - SCORE_TOLERANCE
        && subject_score <= last.score + SCORE_TOLERANCE;

    if within {
        let confidence = if points.len() < preferred_below {
            Confidence::High
        } else {
            Confidence::Medium
        };

        if let Some(exact) = groups
            .iter()
            .find(|group| (group.score - subject_score).abs() < SCORE_TOLERANCE)
        {
            return Ok(InterpolationEstimate {
                value: exact.price,
                confidence,
                lower: exact.clone(),
                upper: exact.clone(),
                extrapolated: false,
            });
        }

        let upper_index = groups
            .iter()
            .position(|group| group.score > subject_score)
            .unwrap_or(groups.len() - 1);
        let lower = &groups[upper_index.saturating_sub(1)];
        let upper = &groups[upper_index];

        return Ok(InterpolationEstimate {
            value: along(lower, upper, subject_score),
            confidence,
            lower: lower.clone(),
            upper: upper.clone(),
            extrapolated: false,
        });
    }

    if !allow_extrapolation {
        return Err(ValuationError::UnbracketedScore {
            subject_score,
            min: first.score,
            max: last.score,
        });
    }

    let (lower, upper) = if subject_score < first.score {
        (first, groups.get(1).unwrap_or(first))
    } else {
        let previous = groups
            .len()
            .checked_sub(2)
            .and_then(|index| groups.get(index));
        (previous.unwrap_or(last), last)
    };

    Ok(InterpolationEstimate {
        value: along(lower, upper, subject_score).max(0.0),
        confidence: Confidence::Low,
        lower: lower.clone(),
        upper: upper.clone(),
        extrapolated: true,
    })
}
