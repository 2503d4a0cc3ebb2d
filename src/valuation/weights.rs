//! Attribute importance weights.
//!
//! Profiles come from a closed set of property-type presets, from caller-supplied
//! custom weights, or from a versioned calibration artifact. Whatever the source,
//! a resolved [`WeightProfile`] always sums to 1.0 within [`WEIGHT_SUM_TOLERANCE`].

use super::calibration::CalibratedWeights;
use super::error::{InputError, ValuationResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// 10th to 90th percentile range of a calibrated weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBand {
    pub p10: f64,
    pub p90: f64,
}

impl WeightBand {
    pub fn contains(&self, weight: f64) -> bool {
        weight >= self.p10 - WEIGHT_SUM_TOLERANCE && weight <= self.p90 + WEIGHT_SUM_TOLERANCE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileSource {
    Preset { profile: String },
    Custom,
    Calibrated { version: u32 },
    Derived { from: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightProfile {
    name: String,
    source: ProfileSource,
    weights: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bands: Option<BTreeMap<String, WeightBand>>,
}

impl WeightProfile {
    /// Accepts weights that already sum to 1.0.
    pub fn new(
        name: &str,
        source: ProfileSource,
        weights: BTreeMap<String, f64>,
    ) -> ValuationResult<Self> {
        check_entries(&weights)?;
        let profile = Self {
            name: name.to_string(),
            source,
            weights,
            bands: None,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Rescales arbitrary non-negative weights so they sum to 1.0.
    pub fn from_unnormalized(
        name: &str,
        source: ProfileSource,
        weights: BTreeMap<String, f64>,
    ) -> ValuationResult<Self> {
        check_entries(&weights)?;
        let sum: f64 = weights.values().sum();
        if sum <= 0.0 {
            return Err(InputError::WeightsDoNotSumToOne { sum }.into());
        }
        let weights = weights
            .into_iter()
            .map(|(attribute, weight)| (attribute, weight / sum))
            .collect();
        Self::new(name, source, weights)
    }

    pub fn with_bands(mut self, bands: BTreeMap<String, WeightBand>) -> Self {
        self.bands = Some(bands);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &ProfileSource {
        &self.source
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn bands(&self) -> Option<&BTreeMap<String, WeightBand>> {
        self.bands.as_ref()
    }

    pub fn weight(&self, attribute: &str) -> Option<f64> {
        self.weights.get(attribute).copied()
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn validate(&self) -> ValuationResult<()> {
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(InputError::WeightsDoNotSumToOne { sum }.into());
        }
        Ok(())
    }

    /// Attribute carrying the largest weight; ties resolve to the first by name.
    pub fn top_attribute(&self) -> Option<&str> {
        self.weights
            .iter()
            .fold(None, |best: Option<(&String, f64)>, (attribute, weight)| match best {
                Some((_, top)) if top >= *weight => best,
                _ => Some((attribute, *weight)),
            })
            .map(|(attribute, _)| attribute.as_str())
    }

    /// Keeps only `attributes`, renormalised, and reports which weights were dropped.
    ///
    /// Fails when an attribute has no weight at all: unconfigured attributes are never
    /// silently zero-weighted.
    pub fn restrict_to(&self, attributes: &[String]) -> ValuationResult<(Self, Vec<String>)> {
        let mut kept = BTreeMap::new();
        for attribute in attributes {
            let weight = self
                .weight(attribute)
                .ok_or_else(|| InputError::UncoveredAttribute(attribute.clone()))?;
            kept.insert(attribute.clone(), weight);
        }

        let dropped: Vec<String> = self
            .weights
            .keys()
            .filter(|attribute| !kept.contains_key(*attribute))
            .cloned()
            .collect();

        if dropped.is_empty() {
            return Ok((self.clone(), dropped));
        }

        debug!(profile = %self.name, ?dropped, "weights renormalised to analysis attributes");
        let restricted = Self::from_unnormalized(
            &self.name,
            ProfileSource::Derived {
                from: self.name.clone(),
            },
            kept,
        )?;
        Ok((restricted, dropped))
    }

    /// Scales one weight by `factor` and spreads the remainder over the others in
    /// proportion to their current weights.
    pub fn perturb(&self, attribute: &str, factor: f64) -> ValuationResult<Self> {
        let current = self
            .weight(attribute)
            .ok_or_else(|| InputError::UnknownAttribute(attribute.to_string()))?;
        let target = (current * factor).clamp(0.0, 1.0);
        let others_before = 1.0 - current;
        let others_after = 1.0 - target;
        let peers = self.weights.len().saturating_sub(1).max(1) as f64;

        let weights = self
            .weights
            .iter()
            .map(|(name, weight)| {
                let adjusted = if name == attribute {
                    target
                } else if others_before > WEIGHT_SUM_TOLERANCE {
                    weight * others_after / others_before
                } else {
                    others_after / peers
                };
                (name.clone(), adjusted)
            })
            .collect();

        Self::from_unnormalized(
            &self.name,
            ProfileSource::Derived {
                from: self.name.clone(),
            },
            weights,
        )
    }
}

fn check_entries(weights: &BTreeMap<String, f64>) -> ValuationResult<()> {
    for (attribute, weight) in weights {
        if !weight.is_finite() || *weight < 0.0 {
            return Err(InputError::InvalidWeight {
                attribute: attribute.clone(),
                value: *weight,
            }
            .into());
        }
    }
    Ok(())
}

/// Curated weight presets per property type, plus caller-supplied weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyTypeProfile {
    Industrial,
    Office,
    Logistics,
    Retail,
    Multifamily,
    Custom(BTreeMap<String, f64>),
}

impl PropertyTypeProfile {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Industrial => "industrial",
            Self::Office => "office",
            Self::Logistics => "logistics",
            Self::Retail => "retail",
            Self::Multifamily => "multifamily",
            Self::Custom(_) => "custom",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "industrial" => Some(Self::Industrial),
            "office" => Some(Self::Office),
            "logistics" => Some(Self::Logistics),
            "retail" => Some(Self::Retail),
            "multifamily" | "multi_family" => Some(Self::Multifamily),
            _ => None,
        }
    }

    fn preset(&self) -> &'static [(&'static str, f64)] {
        match self {
            Self::Industrial => &[
                ("location", 0.25),
                ("building_area", 0.15),
                ("clear_height", 0.15),
                ("loading_docks", 0.10),
                ("age", 0.10),
                ("condition", 0.10),
                ("land_to_building", 0.10),
                ("parking", 0.05),
            ],
            Self::Office => &[
                ("location", 0.30),
                ("condition", 0.20),
                ("age", 0.15),
                ("parking", 0.15),
                ("building_area", 0.10),
                ("floor_plate", 0.10),
            ],
            Self::Logistics => &[
                ("location", 0.20),
                ("highway_access", 0.20),
                ("clear_height", 0.20),
                ("loading_docks", 0.15),
                ("building_area", 0.10),
                ("land_to_building", 0.10),
                ("age", 0.05),
            ],
            Self::Retail => &[
                ("location", 0.35),
                ("traffic_count", 0.20),
                ("parking", 0.15),
                ("building_area", 0.10),
                ("age", 0.10),
                ("condition", 0.10),
            ],
            Self::Multifamily => &[
                ("location", 0.30),
                ("age", 0.20),
                ("condition", 0.20),
                ("unit_count", 0.10),
                ("amenities", 0.10),
                ("parking", 0.10),
            ],
            Self::Custom(_) => &[],
        }
    }

    pub fn resolve(&self) -> ValuationResult<WeightProfile> {
        match self {
            Self::Custom(weights) => {
                WeightProfile::new("custom", ProfileSource::Custom, weights.clone())
            }
            preset => {
                let weights = preset
                    .preset()
                    .iter()
                    .map(|(attribute, weight)| (attribute.to_string(), *weight))
                    .collect();
                WeightProfile::from_unnormalized(
                    preset.label(),
                    ProfileSource::Preset {
                        profile: preset.label().to_string(),
                    },
                    weights,
                )
            }
        }
    }
}

/// Where the weights for an analysis come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightSelection {
    Profile(PropertyTypeProfile),
    Calibrated(CalibratedWeights),
}

impl Default for WeightSelection {
    fn default() -> Self {
        Self::Profile(PropertyTypeProfile::Industrial)
    }
}

impl WeightSelection {
    pub fn resolve(&self) -> ValuationResult<WeightProfile> {
        match self {
            Self::Profile(profile) => profile.resolve(),
            Self::Calibrated(artifact) => artifact.to_profile(),
        }
    }
}
