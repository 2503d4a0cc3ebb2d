use super::domain::{PropertyId, PropertyRole};
use super::error::{InputError, ValuationResult};
use super::ranking::RankTable;
use super::weights::{WeightProfile, WEIGHT_SUM_TOLERANCE};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub property: PropertyId,
    pub role: PropertyRole,
    pub score: f64,
}

/// Composite scores ordered best (lowest) first. Equal scores keep table order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeScores(Vec<CompositeScore>);

impl CompositeScores {
    pub fn entries(&self) -> &[CompositeScore] {
        &self.0
    }

    pub fn subject(&self) -> Option<&CompositeScore> {
        self.0.iter().find(|entry| entry.role == PropertyRole::Subject)
    }

    pub fn comparables(&self) -> impl Iterator<Item = &CompositeScore> {
        self.0
            .iter()
            .filter(|entry| entry.role == PropertyRole::Comparable)
    }

    pub fn score_of(&self, property: &PropertyId) -> Option<f64> {
        self.0
            .iter()
            .find(|entry| &entry.property == property)
            .map(|entry| entry.score)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `score(p) = sum over attributes of weight[a] * rank(p, a)`; lower is better.
///
/// Every attribute in the table needs a weight, and the weights over the table's
/// attributes must sum to 1.0.
pub fn score_properties(
    table: &RankTable,
    weights: &WeightProfile,
) -> ValuationResult<CompositeScores> {
    let mut covered = 0.0;
    let mut resolved = Vec::with_capacity(table.attributes().len());
    for attribute in table.attributes() {
        let weight = weights
            .weight(attribute)
            .ok_or_else(|| InputError::UncoveredAttribute(attribute.clone()))?;
        covered += weight;
        resolved.push((attribute.as_str(), weight));
    }

    if (covered - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(InputError::WeightsDoNotSumToOne { sum: covered }.into());
    }

    let mut scores = table
        .rows()
        .iter()
        .map(|row| {
            let score = resolved
                .iter()
                .map(|(attribute, weight)| weight * row.values.get(*attribute).copied().unwrap_or_default())
                .sum();
            CompositeScore {
                property: row.property.clone(),
                role: row.role,
                score,
            }
        })
        .collect::<Vec<_>>();

    scores.sort_by(|a, b| a.score.total_cmp(&b.score));
    Ok(CompositeScores(scores))
}
