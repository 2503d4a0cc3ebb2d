use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier wrapper for subject and comparable properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyId(pub String);

impl PropertyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PropertyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyRole {
    Subject,
    Comparable,
}

impl PropertyRole {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Subject => "Subject",
            Self::Comparable => "Comparable",
        }
    }
}

/// Physical dimension of a measured attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    BuildingArea,
    LandArea,
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    SquareFeet,
    SquareMeters,
    Acres,
    Hectares,
    Feet,
    Meters,
}

impl Unit {
    pub const fn dimension(self) -> Dimension {
        match self {
            Self::SquareFeet | Self::SquareMeters => Dimension::BuildingArea,
            Self::Acres | Self::Hectares => Dimension::LandArea,
            Self::Feet | Self::Meters => Dimension::Length,
        }
    }

    /// Multiplier into the canonical unit of the dimension (sq ft, acres, feet).
    pub const fn canonical_factor(self) -> f64 {
        match self {
            Self::SquareFeet | Self::Acres | Self::Feet => 1.0,
            Self::SquareMeters => 10.763_910_416_7,
            Self::Hectares => 2.471_053_814_7,
            Self::Meters => 3.280_839_895,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sf" | "sqft" | "sq_ft" | "square_feet" | "ft2" => Some(Self::SquareFeet),
            "sqm" | "sq_m" | "m2" | "square_meters" => Some(Self::SquareMeters),
            "ac" | "acre" | "acres" => Some(Self::Acres),
            "ha" | "hectare" | "hectares" => Some(Self::Hectares),
            "ft" | "feet" => Some(Self::Feet),
            "m" | "meter" | "meters" | "metre" | "metres" => Some(Self::Meters),
            _ => None,
        }
    }
}

/// Raw attribute observation, optionally tagged with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "AttributeValueRepr")]
pub struct AttributeValue {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
}

impl AttributeValue {
    pub fn plain(value: f64) -> Self {
        Self { value, unit: None }
    }

    pub fn measured(value: f64, unit: Unit) -> Self {
        Self {
            value,
            unit: Some(unit),
        }
    }

    /// Value expressed in the canonical unit of its dimension.
    pub fn canonical(&self) -> f64 {
        match self.unit {
            Some(unit) => self.value * unit.canonical_factor(),
            None => self.value,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AttributeValueRepr {
    Plain(f64),
    Measured {
        value: f64,
        #[serde(default)]
        unit: Option<Unit>,
    },
}

impl From<AttributeValueRepr> for AttributeValue {
    fn from(repr: AttributeValueRepr) -> Self {
        match repr {
            AttributeValueRepr::Plain(value) => Self::plain(value),
            AttributeValueRepr::Measured { value, unit } => Self { value, unit },
        }
    }
}

/// Interest conveyed by a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyRights {
    #[default]
    FeeSimple,
    LeasedFee,
    Leasehold,
    PartialInterest,
}

impl PropertyRights {
    pub const fn label(self) -> &'static str {
        match self {
            Self::FeeSimple => "Fee Simple",
            Self::LeasedFee => "Leased Fee",
            Self::Leasehold => "Leasehold",
            Self::PartialInterest => "Partial Interest",
        }
    }
}

/// Financing attached to a sale, used to derive a cash-equivalent price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinancingTerms {
    #[default]
    Cash,
    BelowMarket {
        loan_amount: f64,
        /// Annual contract rate as a fraction (0.04 = 4%).
        contract_rate: f64,
        /// Annual market rate as a fraction.
        market_rate: f64,
        amortization_months: u32,
        term_months: u32,
    },
}

fn default_arms_length() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub transaction_date: Option<NaiveDate>,
    #[serde(default)]
    pub financing: FinancingTerms,
    /// Seller-paid concessions deducted from the contract price.
    #[serde(default)]
    pub concessions: f64,
    #[serde(default = "default_arms_length")]
    pub arms_length: bool,
}

impl TransactionMetadata {
    pub fn cash_sale(price: f64, transaction_date: Option<NaiveDate>) -> Self {
        Self {
            price: Some(price),
            transaction_date,
            financing: FinancingTerms::Cash,
            concessions: 0.0,
            arms_length: true,
        }
    }
}

/// Subject or comparable as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: PropertyId,
    pub role: PropertyRole,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub rights: PropertyRights,
    #[serde(default)]
    pub transaction: Option<TransactionMetadata>,
}

impl PropertyRecord {
    pub fn subject(id: &str) -> Self {
        Self {
            id: PropertyId::from(id),
            role: PropertyRole::Subject,
            attributes: BTreeMap::new(),
            rights: PropertyRights::FeeSimple,
            transaction: None,
        }
    }

    pub fn comparable(id: &str, transaction: TransactionMetadata) -> Self {
        Self {
            id: PropertyId::from(id),
            role: PropertyRole::Comparable,
            attributes: BTreeMap::new(),
            rights: PropertyRights::FeeSimple,
            transaction: Some(transaction),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: f64) -> Self {
        self.attributes
            .insert(name.to_string(), AttributeValue::plain(value));
        self
    }

    pub fn with_measured(mut self, name: &str, value: f64, unit: Unit) -> Self {
        self.attributes
            .insert(name.to_string(), AttributeValue::measured(value, unit));
        self
    }

    pub fn with_rights(mut self, rights: PropertyRights) -> Self {
        self.rights = rights;
        self
    }
}

/// Which raw values rank best for an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Lower raw value ranks better.
    Ascending,
    /// Higher raw value ranks better.
    Descending,
    /// Closer to the subject's value ranks better.
    Context,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    #[default]
    PureRank,
    HybridRankDistance,
}

/// Ranking declaration for one attribute. Fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub scoring: ScoringMode,
}

impl VariableSpec {
    pub fn new(name: &str, direction: Direction) -> Self {
        Self {
            name: name.to_string(),
            direction: Some(direction),
            scoring: ScoringMode::PureRank,
        }
    }

    pub fn hybrid(mut self) -> Self {
        self.scoring = ScoringMode::HybridRankDistance;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    Interpolation,
    Regression,
    #[default]
    Both,
}

impl MappingMethod {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Interpolation => "interpolation",
            Self::Regression => "regression",
            Self::Both => "interpolation + regression",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub const fn level(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_values_accept_bare_numbers_and_measured_objects() {
        let plain: AttributeValue = serde_json::from_str("12.5").expect("bare number");
        assert_eq!(plain, AttributeValue::plain(12.5));

        let measured: AttributeValue =
            serde_json::from_str(r#"{"value": 100.0, "unit": "square_meters"}"#)
                .expect("measured value");
        assert_eq!(measured.unit, Some(Unit::SquareMeters));
        assert!((measured.canonical() - 1076.391_041_67).abs() < 1e-6);
    }

    #[test]
    fn unit_aliases_resolve_to_dimensions() {
        assert_eq!(Unit::parse("SqM"), Some(Unit::SquareMeters));
        assert_eq!(Unit::parse("ha").map(Unit::dimension), Some(Dimension::LandArea));
        assert_eq!(Unit::parse("furlong"), None);
    }

    #[test]
    fn variable_spec_direction_is_optional_on_the_wire() {
        let spec: VariableSpec =
            serde_json::from_str(r#"{"name": "age"}"#).expect("spec without direction");
        assert_eq!(spec.direction, None);
        assert_eq!(spec.scoring, ScoringMode::PureRank);
    }

    #[test]
    fn transactions_default_to_arms_length_cash() {
        let txn: TransactionMetadata =
            serde_json::from_str(r#"{"price": 1000000.0}"#).expect("minimal transaction");
        assert!(txn.arms_length);
        assert_eq!(txn.financing, FinancingTerms::Cash);
    }
}
