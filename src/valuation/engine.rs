//! End-to-end analysis: normalise, rank, weight, score, map and validate.

use super::domain::{MappingMethod, PropertyRecord, VariableSpec};
use super::error::{InputError, ValuationResult};
use super::mapping::{
    MappingSettings, PriceBasis, PriceMapping, PricePoint, ReconciliationPolicy, ScoreToPriceMapper,
    DEFAULT_INTERPOLATION_MAX_COMPARABLES,
};
use super::normalize::{
    normalize_records, ExclusionEntry, ImputationEntry, NormalizationOptions, NormalizedProperty,
};
use super::ranking::{HybridRankDistance, RankTable, RankingEngine};
use super::scoring::{score_properties, CompositeScores};
use super::validation::{validate, ValidationOptions, ValidationReport};
use super::weights::{WeightProfile, WeightSelection};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Run-independent knobs, normally sourced from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub hybrid: HybridRankDistance,
    pub annual_market_trend_pct: f64,
    pub interpolation_max_comparables: usize,
    pub validation: ValidationOptions,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hybrid: HybridRankDistance::default(),
            annual_market_trend_pct: 0.0,
            interpolation_max_comparables: DEFAULT_INTERPOLATION_MAX_COMPARABLES,
            validation: ValidationOptions::default(),
        }
    }
}

/// One analysis: a subject, its comparables and how to value it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub records: Vec<PropertyRecord>,
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub weights: WeightSelection,
    #[serde(default)]
    pub method: MappingMethod,
    #[serde(default)]
    pub valuation_date: Option<NaiveDate>,
    /// Map on price per unit of this attribute instead of total price.
    #[serde(default)]
    pub area_attribute: Option<String>,
    #[serde(default)]
    pub allow_extrapolation: bool,
    #[serde(default)]
    pub reconciliation: ReconciliationPolicy,
}

impl AnalysisRequest {
    pub fn new(records: Vec<PropertyRecord>, variables: Vec<VariableSpec>) -> Self {
        Self {
            records,
            variables,
            weights: WeightSelection::default(),
            method: MappingMethod::default(),
            valuation_date: None,
            area_attribute: None,
            allow_extrapolation: false,
            reconciliation: ReconciliationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationAnalysis {
    pub valuation_date: Option<NaiveDate>,
    pub exclusions: Vec<ExclusionEntry>,
    pub imputations: Vec<ImputationEntry>,
    pub weights: WeightProfile,
    /// Profile attributes not present in this analysis, removed before renormalising.
    pub dropped_weight_attributes: Vec<String>,
    pub rank_table: RankTable,
    pub scores: CompositeScores,
    pub mapping: PriceMapping,
    pub validation: ValidationReport,
}

#[derive(Debug, Clone, Default)]
pub struct ValuationEngine {
    settings: EngineSettings,
}

impl ValuationEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn analyze(&self, request: &AnalysisRequest) -> ValuationResult<ValuationAnalysis> {
        let dataset = normalize_records(
            &request.records,
            &request.variables,
            &NormalizationOptions {
                valuation_date: request.valuation_date,
                annual_market_trend_pct: self.settings.annual_market_trend_pct,
                area_attribute: request.area_attribute.clone(),
            },
        )?;

        let rank_table = RankingEngine::new(self.settings.hybrid).rank(&dataset, &request.variables)?;

        let (weights, dropped_weight_attributes) = request
            .weights
            .resolve()?
            .restrict_to(rank_table.attributes())?;
        let scores = score_properties(&rank_table, &weights)?;
        let subject_score = scores
            .subject()
            .map(|entry| entry.score)
            .ok_or(InputError::MissingSubject)?;

        let basis = match &request.area_attribute {
            Some(area_attribute) => PriceBasis::PerUnitArea {
                area_attribute: area_attribute.clone(),
            },
            None => PriceBasis::Total,
        };
        let subject_area = match &basis {
            PriceBasis::PerUnitArea { area_attribute } => {
                Some(area_of(&dataset.subject, area_attribute)?)
            }
            PriceBasis::Total => None,
        };

        let mut points = Vec::with_capacity(dataset.comparables.len());
        for comparable in &dataset.comparables {
            let price = comparable
                .price
                .as_ref()
                .map(|price| price.time_adjusted)
                .ok_or_else(|| InputError::MissingValue {
                    property: comparable.id.to_string(),
                    attribute: "price".to_string(),
                })?;
            let price = match &basis {
                PriceBasis::PerUnitArea { area_attribute } => {
                    price / area_of(comparable, area_attribute)?
                }
                PriceBasis::Total => price,
            };
            points.push(PricePoint {
                property: comparable.id.clone(),
                score: scores.score_of(&comparable.id).unwrap_or_default(),
                price,
            });
        }

        let settings = MappingSettings {
            method: request.method,
            allow_extrapolation: request.allow_extrapolation,
            reconciliation: request.reconciliation,
            interpolation_max_comparables: self.settings.interpolation_max_comparables,
        };
        let estimate = ScoreToPriceMapper::new(settings.clone()).estimate(&points, subject_score)?;
        let mapping = PriceMapping::new(
            dataset.subject.id.clone(),
            subject_score,
            basis,
            subject_area,
            points,
            settings,
            estimate,
        );

        let validation = validate(&rank_table, &weights, &mapping, &self.settings.validation)?;

        info!(
            subject = %mapping.subject,
            comparables = mapping.points.len(),
            excluded = dataset.exclusions.len(),
            imputed = dataset.imputations.len(),
            subject_score,
            indicated_total = mapping.indicated_total_price,
            confidence = mapping.confidence.label(),
            "valuation analysis complete"
        );

        Ok(ValuationAnalysis {
            valuation_date: dataset.valuation_date,
            exclusions: dataset.exclusions,
            imputations: dataset.imputations,
            weights,
            dropped_weight_attributes,
            rank_table,
            scores,
            mapping,
            validation,
        })
    }
}

fn area_of(property: &NormalizedProperty, attribute: &str) -> ValuationResult<f64> {
    let area = property
        .value(attribute)
        .ok_or_else(|| InputError::MissingValue {
            property: property.id.to_string(),
            attribute: attribute.to_string(),
        })?;
    if !area.is_finite() || area <= 0.0 {
        return Err(InputError::InvalidArea {
            property: property.id.to_string(),
            area,
        }
        .into());
    }
    Ok(area)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valuation::domain::{Direction, TransactionMetadata};
    use crate::valuation::error::ValuationError;
    use crate::valuation::weights::PropertyTypeProfile;
    use std::collections::BTreeMap;

    fn request() -> AnalysisRequest {
        let comparable = |id: &str, price: f64, location: f64, area: f64| {
            PropertyRecord::comparable(id, TransactionMetadata::cash_sale(price, None))
                .with_attribute("location", location)
                .with_attribute("building_area", area)
        };
        let mut request = AnalysisRequest::new(
            vec![
                PropertyRecord::subject("S")
                    .with_attribute("location", 7.0)
                    .with_attribute("building_area", 10_000.0),
                comparable("C1", 1_500_000.0, 9.0, 10_000.0),
                comparable("C2", 1_200_000.0, 6.0, 10_000.0),
                comparable("C3", 1_000_000.0, 4.0, 10_000.0),
            ],
            vec![
                VariableSpec::new("location", Direction::Descending),
                VariableSpec::new("building_area", Direction::Context),
            ],
        );
        request.weights = WeightSelection::Profile(PropertyTypeProfile::Custom(BTreeMap::from([
            ("location".to_string(), 1.0),
            ("building_area".to_string(), 0.0),
        ])));
        request
    }

    #[test]
    fn analysis_maps_on_total_price_by_default() {
        let analysis = ValuationEngine::default().analyze(&request()).expect("analysis");
        assert_eq!(analysis.mapping.basis, PriceBasis::Total);
        assert_eq!(analysis.mapping.indicated_price_per_unit, None);
        // subject ranks 2 between C1 (1) and C2 (3)
        assert!((analysis.mapping.subject_score - 2.0).abs() < 1e-12);
        assert!((analysis.mapping.indicated_total_price - 1_350_000.0).abs() < 1e-6);
    }

    #[test]
    fn area_attribute_switches_to_per_unit_pricing() {
        let mut request = request();
        request.area_attribute = Some("building_area".to_string());
        let analysis = ValuationEngine::default().analyze(&request).expect("analysis");

        assert!((analysis.mapping.indicated_value - 135.0).abs() < 1e-9);
        assert_eq!(analysis.mapping.indicated_price_per_unit, Some(analysis.mapping.indicated_value));
        assert!((analysis.mapping.indicated_total_price - 1_350_000.0).abs() < 1e-6);
    }

    #[test]
    fn preset_weights_are_restricted_and_disclosed() {
        let mut request = request();
        request.weights = WeightSelection::Profile(PropertyTypeProfile::Industrial);
        let analysis = ValuationEngine::default().analyze(&request).expect("analysis");

        assert!((analysis.weights.sum() - 1.0).abs() < 1e-9);
        assert!(analysis
            .dropped_weight_attributes
            .contains(&"clear_height".to_string()));
        assert_eq!(analysis.weights.weights().len(), 2);
    }

    #[test]
    fn zero_area_is_rejected() {
        let mut request = request();
        request.area_attribute = Some("building_area".to_string());
        request.records[2] = request.records[2].clone().with_attribute("building_area", 0.0);
        let err = ValuationEngine::default().analyze(&request).expect_err("zero area");
        assert!(matches!(err, ValuationError::Input(InputError::InvalidArea { .. })));
    }

    #[test]
    fn collapsing_market_trend_fails_instead_of_valuing_at_nan() {
        let mut request = request();
        request.valuation_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        for record in request.records.iter_mut() {
            if let Some(transaction) = record.transaction.as_mut() {
                transaction.transaction_date = NaiveDate::from_ymd_opt(2024, 1, 1);
            }
        }
        let engine = ValuationEngine::new(EngineSettings {
            annual_market_trend_pct: -150.0,
            ..EngineSettings::default()
        });

        let err = engine.analyze(&request).expect_err("invalid trend");
        assert_eq!(
            err,
            ValuationError::Input(InputError::InvalidMarketTrend(-150.0))
        );
    }
}
