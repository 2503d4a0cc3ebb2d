//! Per-attribute ranking of the subject and its comparables.
//!
//! Rank 1 is always the best property for an attribute regardless of direction.
//! Ties share the mean of the ranks they occupy. The scoring mode of each variable
//! picks a [`RankingStrategy`]: plain ordinal ranks, or ranks blended with a
//! normalised distance so large quantitative gaps survive into the composite.

use super::domain::{Direction, PropertyId, PropertyRole, ScoringMode, VariableSpec};
use super::error::{InputError, ValuationResult};
use super::normalize::NormalizedDataset;
use super::stats::{mean, std_dev};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

const TIE_TOLERANCE: f64 = 1e-10;

/// One attribute column handed to a strategy.
#[derive(Debug, Clone, Copy)]
pub struct RankColumn<'a> {
    pub values: &'a [f64],
    pub direction: Direction,
    pub subject_value: f64,
}

impl RankColumn<'_> {
    /// Keys where smaller always means better.
    fn keys(&self) -> Vec<f64> {
        self.values
            .iter()
            .map(|value| match self.direction {
                Direction::Ascending => *value,
                Direction::Descending => -*value,
                Direction::Context => (*value - self.subject_value).abs(),
            })
            .collect()
    }
}

/// Turns one attribute column into per-property scores on the 1..N scale.
pub trait RankingStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, column: &RankColumn<'_>) -> Vec<f64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PureRank;

impl RankingStrategy for PureRank {
    fn name(&self) -> &'static str {
        "pure_rank"
    }

    fn score(&self, column: &RankColumn<'_>) -> Vec<f64> {
        average_ranks(&column.keys())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DistanceMeasure {
    /// Position of the value within the observed min..max range.
    RangePosition,
    /// Standard score, capped symmetrically at `cap`.
    ZScore { cap: f64 },
}

impl Default for DistanceMeasure {
    fn default() -> Self {
        Self::ZScore { cap: 2.0 }
    }
}

/// Blends the ordinal rank with a magnitude-aware position on the same 1..N scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridRankDistance {
    /// Share of the ordinal rank in the blend; the distance term takes the rest.
    pub rank_share: f64,
    pub measure: DistanceMeasure,
}

impl Default for HybridRankDistance {
    fn default() -> Self {
        Self {
            rank_share: 0.5,
            measure: DistanceMeasure::default(),
        }
    }
}

impl HybridRankDistance {
    fn positions(&self, keys: &[f64]) -> Vec<f64> {
        let n = keys.len() as f64;
        let midpoint = (n + 1.0) / 2.0;

        match self.measure {
            DistanceMeasure::RangePosition => {
                let min = keys.iter().copied().fold(f64::INFINITY, f64::min);
                let max = keys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let span = max - min;
                if span <= TIE_TOLERANCE {
                    return vec![midpoint; keys.len()];
                }
                keys.iter()
                    .map(|key| 1.0 + (n - 1.0) * (key - min) / span)
                    .collect()
            }
            DistanceMeasure::ZScore { cap } => {
                let cap = cap.abs().max(f64::EPSILON);
                let centre = mean(keys).unwrap_or_default();
                let spread = std_dev(keys).unwrap_or_default();
                if spread <= TIE_TOLERANCE {
                    return vec![midpoint; keys.len()];
                }
                keys.iter()
                    .map(|key| {
                        let z = ((key - centre) / spread).clamp(-cap, cap);
                        1.0 + (n - 1.0) * (z + cap) / (2.0 * cap)
                    })
                    .collect()
            }
        }
    }
}

impl RankingStrategy for HybridRankDistance {
    fn name(&self) -> &'static str {
        "hybrid_rank_distance"
    }

    fn score(&self, column: &RankColumn<'_>) -> Vec<f64> {
        let keys = column.keys();
        let ranks = average_ranks(&keys);
        let positions = self.positions(&keys);
        let share = self.rank_share.clamp(0.0, 1.0);

        ranks
            .iter()
            .zip(positions)
            .map(|(rank, position)| share * rank + (1.0 - share) * position)
            .collect()
    }
}

/// Assigns ranks 1..N to `keys` (smaller key is better), averaging ties.
pub fn average_ranks(keys: &[f64]) -> Vec<f64> {
    let n = keys.len();
    let mut indexed: Vec<(usize, f64)> = keys.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start;
        while end + 1 < n && (indexed[end + 1].1 - indexed[start].1).abs() < TIE_TOLERANCE {
            end += 1;
        }
        let shared = (start + end + 2) as f64 / 2.0;
        for (index, _) in &indexed[start..=end] {
            ranks[*index] = shared;
        }
        start = end + 1;
    }
    ranks
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankRow {
    pub property: PropertyId,
    pub role: PropertyRole,
    pub values: BTreeMap<String, f64>,
}

/// Rank or hybrid score of every property on every attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankTable {
    attributes: Vec<String>,
    modes: BTreeMap<String, ScoringMode>,
    rows: Vec<RankRow>,
}

impl RankTable {
    /// Builds a table from precomputed rows. Every row must carry every attribute.
    pub fn from_rows(attributes: Vec<String>, rows: Vec<RankRow>) -> ValuationResult<Self> {
        for row in &rows {
            for attribute in &attributes {
                if !row.values.contains_key(attribute) {
                    return Err(InputError::MissingValue {
                        property: row.property.to_string(),
                        attribute: attribute.clone(),
                    }
                    .into());
                }
            }
        }
        let modes = attributes
            .iter()
            .map(|attribute| (attribute.clone(), ScoringMode::PureRank))
            .collect();
        Ok(Self {
            attributes,
            modes,
            rows,
        })
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn mode(&self, attribute: &str) -> Option<ScoringMode> {
        self.modes.get(attribute).copied()
    }

    pub fn rows(&self) -> &[RankRow] {
        &self.rows
    }

    pub fn row(&self, property: &PropertyId) -> Option<&RankRow> {
        self.rows.iter().find(|row| &row.property == property)
    }

    pub fn subject(&self) -> Option<&RankRow> {
        self.rows.iter().find(|row| row.role == PropertyRole::Subject)
    }

    pub fn value(&self, property: &PropertyId, attribute: &str) -> Option<f64> {
        self.row(property)
            .and_then(|row| row.values.get(attribute).copied())
    }

    pub fn column(&self, attribute: &str) -> Vec<f64> {
        self.rows
            .iter()
            .filter_map(|row| row.values.get(attribute).copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Holds one strategy per scoring mode, fixed at construction.
pub struct RankingEngine {
    pure: PureRank,
    hybrid: HybridRankDistance,
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self::new(HybridRankDistance::default())
    }
}

impl RankingEngine {
    pub fn new(hybrid: HybridRankDistance) -> Self {
        Self {
            pure: PureRank,
            hybrid,
        }
    }

    pub fn strategy(&self, mode: ScoringMode) -> &dyn RankingStrategy {
        match mode {
            ScoringMode::PureRank => &self.pure,
            ScoringMode::HybridRankDistance => &self.hybrid,
        }
    }

    pub fn rank(
        &self,
        dataset: &NormalizedDataset,
        variables: &[VariableSpec],
    ) -> ValuationResult<RankTable> {
        if variables.is_empty() {
            return Err(InputError::NoVariables.into());
        }

        let mut declared = HashSet::new();
        for spec in variables {
            if !declared.insert(spec.name.as_str()) {
                return Err(InputError::DuplicateVariable(spec.name.clone()).into());
            }
        }

        let properties: Vec<_> = dataset.properties().collect();
        let mut rows: Vec<RankRow> = properties
            .iter()
            .map(|property| RankRow {
                property: property.id.clone(),
                role: property.role,
                values: BTreeMap::new(),
            })
            .collect();
        let mut modes = BTreeMap::new();

        for spec in variables {
            let direction = spec
                .direction
                .ok_or_else(|| InputError::MissingDirection(spec.name.clone()))?;

            if properties.len() < 2 {
                return Err(InputError::TooFewPropertiesForAttribute {
                    attribute: spec.name.clone(),
                    found: properties.len(),
                }
                .into());
            }

            let values = properties
                .iter()
                .map(|property| {
                    property.value(&spec.name).ok_or_else(|| InputError::MissingValue {
                        property: property.id.to_string(),
                        attribute: spec.name.clone(),
                    })
                })
                .collect::<Result<Vec<f64>, InputError>>()?;

            let column = RankColumn {
                values: &values,
                direction,
                subject_value: dataset
                    .subject
                    .value(&spec.name)
                    .unwrap_or_default(),
            };
            let strategy = self.strategy(spec.scoring);
            let scores = strategy.score(&column);
            debug!(attribute = %spec.name, strategy = strategy.name(), "attribute ranked");

            for (row, score) in rows.iter_mut().zip(scores) {
                row.values.insert(spec.name.clone(), score);
            }
            modes.insert(spec.name.clone(), spec.scoring);
        }

        Ok(RankTable {
            attributes: variables.iter().map(|spec| spec.name.clone()).collect(),
            modes,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valuation::domain::{PropertyRecord, TransactionMetadata};
    use crate::valuation::error::ValuationError;
    use crate::valuation::normalize::{normalize_records, NormalizationOptions};

    fn dataset(values: &[f64], specs: &[VariableSpec]) -> NormalizedDataset {
        let mut records = vec![PropertyRecord::subject("S").with_attribute("x", values[0])];
        for (index, value) in values.iter().enumerate().skip(1) {
            records.push(
                PropertyRecord::comparable(
                    &format!("C{index}"),
                    TransactionMetadata::cash_sale(100.0, None),
                )
                .with_attribute("x", *value),
            );
        }
        normalize_records(&records, specs, &NormalizationOptions::default()).expect("normalises")
    }

    #[test]
    fn average_ranks_share_tied_positions() {
        let ranks = average_ranks(&[3.0, 1.0, 3.0, 2.0]);
        assert_eq!(ranks, vec![3.5, 1.0, 3.5, 2.0]);
        let total: f64 = ranks.iter().sum();
        assert_eq!(total, 10.0);
    }

    #[test]
    fn descending_attribute_ranks_maximum_first() {
        let specs = vec![VariableSpec::new("x", Direction::Descending)];
        let data = dataset(&[20.0, 35.0, 10.0, 50.0], &specs);
        let table = RankingEngine::default().rank(&data, &specs).expect("ranks");

        let best = table
            .rows()
            .iter()
            .min_by(|a, b| a.values["x"].total_cmp(&b.values["x"]))
            .expect("rows");
        assert_eq!(best.property, PropertyId::from("C3"));

        let mut column = table.column("x");
        column.sort_by(f64::total_cmp);
        assert_eq!(column, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn ascending_attribute_ranks_minimum_first() {
        let specs = vec![VariableSpec::new("x", Direction::Ascending)];
        let data = dataset(&[20.0, 35.0, 10.0, 50.0], &specs);
        let table = RankingEngine::default().rank(&data, &specs).expect("ranks");
        assert_eq!(table.value(&PropertyId::from("C2"), "x"), Some(1.0));
        assert_eq!(table.value(&PropertyId::from("C3"), "x"), Some(4.0));
    }

    #[test]
    fn context_direction_prefers_values_near_the_subject() {
        let specs = vec![VariableSpec::new("x", Direction::Context)];
        let data = dataset(&[20.0, 22.0, 5.0, 40.0], &specs);
        let table = RankingEngine::default().rank(&data, &specs).expect("ranks");
        assert_eq!(table.value(&PropertyId::from("S"), "x"), Some(1.0));
        assert_eq!(table.value(&PropertyId::from("C1"), "x"), Some(2.0));
        assert_eq!(table.value(&PropertyId::from("C3"), "x"), Some(4.0));
    }

    #[test]
    fn hybrid_mode_preserves_magnitude_gaps() {
        let pure = vec![VariableSpec::new("x", Direction::Descending)];
        let hybrid = vec![VariableSpec::new("x", Direction::Descending).hybrid()];
        let values = [100.0, 99.0, 98.0, 10.0];

        let engine = RankingEngine::new(HybridRankDistance {
            rank_share: 0.5,
            measure: DistanceMeasure::RangePosition,
        });
        let pure_table = engine.rank(&dataset(&values, &pure), &pure).expect("ranks");
        let hybrid_table = engine
            .rank(&dataset(&values, &hybrid), &hybrid)
            .expect("ranks");

        let gap = |table: &RankTable| {
            table.value(&PropertyId::from("C3"), "x").unwrap_or_default()
                - table.value(&PropertyId::from("C2"), "x").unwrap_or_default()
        };
        assert_eq!(gap(&pure_table), 1.0);
        assert!(gap(&hybrid_table) > 1.0, "hybrid gap should widen");
        assert_eq!(hybrid_table.mode("x"), Some(ScoringMode::HybridRankDistance));
    }

    #[test]
    fn capped_z_scores_stay_on_the_rank_scale() {
        let specs = vec![VariableSpec::new("x", Direction::Descending).hybrid()];
        let values = [100.0, 99.0, 98.0, 10.0, 97.0];
        let engine = RankingEngine::new(HybridRankDistance {
            rank_share: 0.5,
            measure: DistanceMeasure::ZScore { cap: 1.0 },
        });
        let table = engine.rank(&dataset(&values, &specs), &specs).expect("ranks");

        let column = table.column("x");
        assert!(column.iter().all(|score| (1.0..=5.0).contains(score)));
        let best = table
            .rows()
            .iter()
            .min_by(|a, b| a.values["x"].total_cmp(&b.values["x"]))
            .expect("rows");
        assert_eq!(best.property, PropertyId::from("S"));
        // the 10 sits well past one standard deviation: worst rank, clamped position
        assert_eq!(table.value(&PropertyId::from("C3"), "x"), Some(5.0));
    }

    #[test]
    fn missing_direction_is_rejected() {
        let specs = vec![VariableSpec {
            name: "x".to_string(),
            direction: None,
            scoring: ScoringMode::PureRank,
        }];
        let data = dataset(&[1.0, 2.0, 3.0, 4.0], &specs);
        let err = RankingEngine::default()
            .rank(&data, &specs)
            .expect_err("direction required");
        assert_eq!(
            err,
            ValuationError::from(InputError::MissingDirection("x".to_string()))
        );
    }
}
