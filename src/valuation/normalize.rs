//! Attribute normalisation: unit conversion, cash equivalence, time adjustment,
//! exclusion of atypical transactions and median imputation of missing values.

use super::domain::{
    Dimension, FinancingTerms, PropertyId, PropertyRecord, PropertyRights, PropertyRole,
    TransactionMetadata, VariableSpec,
};
use super::error::{InputError, ValuationResult};
use super::stats::median;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

pub const MIN_COMPARABLES: usize = 3;

const DAYS_PER_MONTH: f64 = 30.4375;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizationOptions {
    pub valuation_date: Option<NaiveDate>,
    /// Annual market-conditions trend in percent, compounded monthly from sale to valuation date.
    pub annual_market_trend_pct: f64,
    /// Attribute holding the area used for per-unit pricing; imputed like any variable.
    pub area_attribute: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    NonArmsLength,
    AtypicalRights,
    MissingPrice,
    NonPositiveAdjustedPrice,
}

impl ExclusionReason {
    pub const fn code(self) -> &'static str {
        match self {
            Self::NonArmsLength => "non_arms_length",
            Self::AtypicalRights => "atypical_rights",
            Self::MissingPrice => "missing_price",
            Self::NonPositiveAdjustedPrice => "non_positive_adjusted_price",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionEntry {
    pub property: PropertyId,
    pub reason: ExclusionReason,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputationEntry {
    pub property: PropertyId,
    pub attribute: String,
    pub value: f64,
}

/// Sale price carried through the normalisation steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPrice {
    pub contract: f64,
    pub cash_equivalent: f64,
    pub time_adjusted: f64,
    /// Months between the transaction and the valuation date, when both are known.
    pub months_elapsed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedProperty {
    pub id: PropertyId,
    pub role: PropertyRole,
    pub attributes: BTreeMap<String, f64>,
    pub imputed: BTreeSet<String>,
    pub price: Option<NormalizedPrice>,
}

impl NormalizedProperty {
    pub fn value(&self, attribute: &str) -> Option<f64> {
        self.attributes.get(attribute).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDataset {
    pub subject: NormalizedProperty,
    pub comparables: Vec<NormalizedProperty>,
    pub exclusions: Vec<ExclusionEntry>,
    pub imputations: Vec<ImputationEntry>,
    pub valuation_date: Option<NaiveDate>,
}

impl NormalizedDataset {
    /// Subject first, then retained comparables in input order.
    pub fn properties(&self) -> impl Iterator<Item = &NormalizedProperty> {
        std::iter::once(&self.subject).chain(self.comparables.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.comparables.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

pub fn normalize_records(
    records: &[PropertyRecord],
    variables: &[VariableSpec],
    options: &NormalizationOptions,
) -> ValuationResult<NormalizedDataset> {
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(&record.id) {
            return Err(InputError::DuplicateProperty(record.id.to_string()).into());
        }
    }

    let subjects: Vec<&PropertyRecord> = records
        .iter()
        .filter(|record| record.role == PropertyRole::Subject)
        .collect();
    let subject = match subjects.as_slice() {
        [] => return Err(InputError::MissingSubject.into()),
        [only] => *only,
        many => return Err(InputError::MultipleSubjects(many.len()).into()),
    };

    let trend = options.annual_market_trend_pct;
    if !trend.is_finite() || trend <= -100.0 {
        return Err(InputError::InvalidMarketTrend(trend).into());
    }

    let mut exclusions = Vec::new();
    let mut retained = Vec::new();
    for record in records
        .iter()
        .filter(|record| record.role == PropertyRole::Comparable)
    {
        let screened = screen_comparable(record, subject.rights)
            .and_then(|transaction| adjusted_price(record, transaction, options));
        match screened {
            Ok(price) => retained.push((record, price)),
            Err(entry) => {
                info!(
                    property = %entry.property,
                    reason = entry.reason.code(),
                    "comparable excluded"
                );
                exclusions.push(entry);
            }
        }
    }

    if retained.len() < MIN_COMPARABLES {
        return Err(InputError::TooFewComparables {
            required: MIN_COMPARABLES,
            found: retained.len(),
        }
        .into());
    }

    let peers: Vec<&PropertyRecord> = std::iter::once(subject)
        .chain(retained.iter().map(|(record, _)| *record))
        .collect();
    let mut converted = convert_units(&peers)?;

    let mut required: Vec<&str> = variables.iter().map(|spec| spec.name.as_str()).collect();
    if let Some(area) = options.area_attribute.as_deref() {
        if !required.contains(&area) {
            required.push(area);
        }
    }
    let imputations = impute_missing(&peers, &mut converted, &required)?;

    let mut imputed_by_property: BTreeMap<&PropertyId, BTreeSet<String>> = BTreeMap::new();
    for entry in &imputations {
        imputed_by_property
            .entry(&entry.property)
            .or_default()
            .insert(entry.attribute.clone());
    }

    let mut normalized = peers
        .iter()
        .zip(converted)
        .map(|(record, attributes)| NormalizedProperty {
            id: record.id.clone(),
            role: record.role,
            imputed: imputed_by_property
                .get(&record.id)
                .cloned()
                .unwrap_or_default(),
            attributes,
            price: None,
        })
        .collect::<Vec<_>>();

    for (property, (_, price)) in normalized.iter_mut().skip(1).zip(retained) {
        property.price = Some(price);
    }

    let subject = normalized.remove(0);
    debug!(
        comparables = normalized.len(),
        excluded = exclusions.len(),
        imputed = imputations.len(),
        "records normalised"
    );

    Ok(NormalizedDataset {
        subject,
        comparables: normalized,
        exclusions,
        imputations,
        valuation_date: options.valuation_date,
    })
}

fn screen_comparable(
    record: &PropertyRecord,
    subject_rights: PropertyRights,
) -> Result<&TransactionMetadata, ExclusionEntry> {
    let exclude = |reason: ExclusionReason, detail: String| ExclusionEntry {
        property: record.id.clone(),
        reason,
        detail,
    };

    let transaction = match &record.transaction {
        Some(transaction) => transaction,
        None => {
            return Err(exclude(
                ExclusionReason::MissingPrice,
                "no transaction recorded".to_string(),
            ))
        }
    };

    if !transaction.arms_length {
        return Err(exclude(
            ExclusionReason::NonArmsLength,
            "transaction flagged as not arm's length".to_string(),
        ));
    }

    if record.rights != subject_rights {
        return Err(exclude(
            ExclusionReason::AtypicalRights,
            format!(
                "conveyed {} while the subject is appraised as {}",
                record.rights.label(),
                subject_rights.label()
            ),
        ));
    }

    match transaction.price {
        Some(price) if price.is_finite() && price > 0.0 => Ok(transaction),
        Some(price) => Err(exclude(
            ExclusionReason::MissingPrice,
            format!("unusable sale price {price}"),
        )),
        None => Err(exclude(
            ExclusionReason::MissingPrice,
            "sale price not reported".to_string(),
        )),
    }
}

fn convert_units(peers: &[&PropertyRecord]) -> ValuationResult<Vec<BTreeMap<String, f64>>> {
    let mut dimensions: BTreeMap<&str, Dimension> = BTreeMap::new();
    for record in peers {
        for (name, value) in &record.attributes {
            if let Some(unit) = value.unit {
                match dimensions.get(name.as_str()) {
                    Some(existing) if *existing != unit.dimension() => {
                        return Err(InputError::UnitMismatch {
                            attribute: name.clone(),
                        }
                        .into());
                    }
                    Some(_) => {}
                    None => {
                        dimensions.insert(name.as_str(), unit.dimension());
                    }
                }
            }
        }
    }

    Ok(peers
        .iter()
        .map(|record| {
            record
                .attributes
                .iter()
                .filter(|(_, value)| value.value.is_finite())
                .map(|(name, value)| (name.clone(), value.canonical()))
                .collect()
        })
        .collect())
}

fn impute_missing(
    peers: &[&PropertyRecord],
    converted: &mut [BTreeMap<String, f64>],
    attributes: &[&str],
) -> ValuationResult<Vec<ImputationEntry>> {
    let mut imputations = Vec::new();

    for attribute in attributes {
        let observed: Vec<f64> = converted
            .iter()
            .filter_map(|values| values.get(*attribute).copied())
            .collect();

        if observed.len() == converted.len() {
            continue;
        }

        let fill = median(&observed).ok_or_else(|| InputError::NoObservedValues {
            attribute: attribute.to_string(),
        })?;

        for (record, values) in peers.iter().zip(converted.iter_mut()) {
            if values.contains_key(*attribute) {
                continue;
            }
            values.insert(attribute.to_string(), fill);
            debug!(property = %record.id, attribute, value = fill, "imputed from peer median");
            imputations.push(ImputationEntry {
                property: record.id.clone(),
                attribute: attribute.to_string(),
                value: fill,
            });
        }
    }

    Ok(imputations)
}

/// Cash-equivalent, time-adjusted price, or an exclusion when adjustments leave nothing
/// positive to map.
fn adjusted_price(
    record: &PropertyRecord,
    transaction: &TransactionMetadata,
    options: &NormalizationOptions,
) -> Result<NormalizedPrice, ExclusionEntry> {
    let price = normalize_price(transaction, options);
    if price.time_adjusted.is_finite() && price.time_adjusted > 0.0 {
        return Ok(price);
    }
    Err(ExclusionEntry {
        property: record.id.clone(),
        reason: ExclusionReason::NonPositiveAdjustedPrice,
        detail: format!(
            "contract price {} adjusts to {} after financing, concessions and market trend",
            price.contract, price.time_adjusted
        ),
    })
}

fn normalize_price(transaction: &TransactionMetadata, options: &NormalizationOptions) -> NormalizedPrice {
    let contract = transaction.price.unwrap_or_default();
    let cash_equivalent =
        cash_equivalent_price(contract, &transaction.financing, transaction.concessions);

    let months_elapsed = match (transaction.transaction_date, options.valuation_date) {
        (Some(sold), Some(valued)) => Some((valued - sold).num_days() as f64 / DAYS_PER_MONTH),
        _ => None,
    };

    let time_adjusted = match months_elapsed {
        Some(months) => time_adjust(cash_equivalent, months, options.annual_market_trend_pct),
        None => cash_equivalent,
    };

    NormalizedPrice {
        contract,
        cash_equivalent,
        time_adjusted,
        months_elapsed,
    }
}

/// Converts a contract price into its all-cash equivalent.
///
/// Below-market financing is valued by discounting the contract payments and any
/// balloon at the market rate; the difference between that present value and the
/// face amount of the loan comes off the price. Concessions are deducted as-is.
pub fn cash_equivalent_price(price: f64, financing: &FinancingTerms, concessions: f64) -> f64 {
    let financed = match financing {
        FinancingTerms::Cash => price,
        FinancingTerms::BelowMarket {
            loan_amount,
            contract_rate,
            market_rate,
            amortization_months,
            term_months,
        } => {
            let amortization = (*amortization_months).max(1) as i32;
            let horizon = (*term_months).clamp(1, amortization as u32) as i32;
            let contract_monthly = contract_rate / 12.0;
            let market_monthly = market_rate / 12.0;

            let payment = level_payment(*loan_amount, contract_monthly, amortization);
            let balloon = remaining_balance(*loan_amount, contract_monthly, payment, horizon);
            let present_value = annuity_present_value(payment, market_monthly, horizon)
                + balloon / (1.0 + market_monthly).powi(horizon);

            price - loan_amount + present_value
        }
    };

    financed - concessions
}

fn level_payment(principal: f64, monthly_rate: f64, periods: i32) -> f64 {
    if monthly_rate.abs() < 1e-12 {
        return principal / periods as f64;
    }
    principal * monthly_rate / (1.0 - (1.0 + monthly_rate).powi(-periods))
}

fn remaining_balance(principal: f64, monthly_rate: f64, payment: f64, elapsed: i32) -> f64 {
    let balance = if monthly_rate.abs() < 1e-12 {
        principal - payment * elapsed as f64
    } else {
        let growth = (1.0 + monthly_rate).powi(elapsed);
        principal * growth - payment * (growth - 1.0) / monthly_rate
    };
    balance.max(0.0)
}

fn annuity_present_value(payment: f64, monthly_rate: f64, periods: i32) -> f64 {
    if monthly_rate.abs() < 1e-12 {
        return payment * periods as f64;
    }
    payment * (1.0 - (1.0 + monthly_rate).powi(-periods)) / monthly_rate
}

/// Compounds a price forward (or back) by `months` at an annual trend.
pub fn time_adjust(price: f64, months: f64, annual_trend_pct: f64) -> f64 {
    price * (1.0 + annual_trend_pct / 100.0).powf(months / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valuation::domain::{Direction, Unit};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn comp(id: &str, price: f64) -> PropertyRecord {
        PropertyRecord::comparable(id, TransactionMetadata::cash_sale(price, None))
    }

    fn variables() -> Vec<VariableSpec> {
        vec![VariableSpec::new("age", Direction::Ascending)]
    }

    #[test]
    fn rejects_analyses_without_enough_comparables() {
        let records = vec![
            PropertyRecord::subject("S").with_attribute("age", 10.0),
            comp("C1", 100.0).with_attribute("age", 5.0),
            comp("C2", 90.0).with_attribute("age", 15.0),
        ];

        let err = normalize_records(&records, &variables(), &NormalizationOptions::default())
            .expect_err("two comparables are not enough");
        assert!(matches!(
            err,
            crate::valuation::ValuationError::Input(InputError::TooFewComparables {
                required: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn excludes_non_arms_length_and_atypical_rights_with_reason_codes() {
        let mut related_party = comp("C4", 50.0).with_attribute("age", 1.0);
        if let Some(txn) = related_party.transaction.as_mut() {
            txn.arms_length = false;
        }
        let records = vec![
            PropertyRecord::subject("S").with_attribute("age", 10.0),
            comp("C1", 100.0).with_attribute("age", 5.0),
            comp("C2", 90.0).with_attribute("age", 15.0),
            comp("C3", 80.0).with_attribute("age", 25.0),
            related_party,
            comp("C5", 70.0)
                .with_attribute("age", 2.0)
                .with_rights(PropertyRights::LeasedFee),
        ];

        let dataset = normalize_records(&records, &variables(), &NormalizationOptions::default())
            .expect("normalises");
        assert_eq!(dataset.comparables.len(), 3);
        let reasons: Vec<_> = dataset.exclusions.iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            vec![ExclusionReason::NonArmsLength, ExclusionReason::AtypicalRights]
        );
    }

    #[test]
    fn imputes_missing_values_from_peer_median_and_flags_them() {
        let records = vec![
            PropertyRecord::subject("S").with_attribute("age", 10.0),
            comp("C1", 100.0).with_attribute("age", 4.0),
            comp("C2", 90.0),
            comp("C3", 80.0).with_attribute("age", 30.0),
        ];

        let dataset = normalize_records(&records, &variables(), &NormalizationOptions::default())
            .expect("normalises");
        let c2 = &dataset.comparables[1];
        assert_eq!(c2.value("age"), Some(10.0));
        assert!(c2.imputed.contains("age"));
        assert_eq!(dataset.imputations.len(), 1);
        assert!(dataset.subject.imputed.is_empty());
    }

    #[test]
    fn converts_units_to_canonical_and_rejects_mixed_dimensions() {
        let records = vec![
            PropertyRecord::subject("S").with_measured("size", 1000.0, Unit::SquareMeters),
            comp("C1", 100.0).with_measured("size", 10_000.0, Unit::SquareFeet),
            comp("C2", 90.0).with_attribute("size", 9_000.0),
            comp("C3", 80.0).with_attribute("size", 8_000.0),
        ];
        let specs = vec![VariableSpec::new("size", Direction::Descending)];
        let dataset =
            normalize_records(&records, &specs, &NormalizationOptions::default()).expect("ok");
        assert!((dataset.subject.value("size").unwrap_or_default() - 10_763.910_416_7).abs() < 1e-6);

        let mixed = vec![
            PropertyRecord::subject("S").with_measured("size", 1.0, Unit::Acres),
            comp("C1", 100.0).with_measured("size", 10_000.0, Unit::SquareFeet),
            comp("C2", 90.0).with_attribute("size", 9_000.0),
            comp("C3", 80.0).with_attribute("size", 8_000.0),
        ];
        let err = normalize_records(&mixed, &specs, &NormalizationOptions::default())
            .expect_err("acres and square feet do not mix");
        assert!(err.is_input());
    }

    #[test]
    fn cash_equivalence_discounts_below_market_financing() {
        let financing = FinancingTerms::BelowMarket {
            loan_amount: 800_000.0,
            contract_rate: 0.03,
            market_rate: 0.07,
            amortization_months: 300,
            term_months: 60,
        };
        let adjusted = cash_equivalent_price(1_000_000.0, &financing, 10_000.0);
        assert!(adjusted < 990_000.0, "below-market debt inflates price: {adjusted}");
        assert!(adjusted > 850_000.0, "discount stays plausible: {adjusted}");

        let same_rate = FinancingTerms::BelowMarket {
            loan_amount: 800_000.0,
            contract_rate: 0.05,
            market_rate: 0.05,
            amortization_months: 300,
            term_months: 60,
        };
        let unchanged = cash_equivalent_price(1_000_000.0, &same_rate, 0.0);
        assert!((unchanged - 1_000_000.0).abs() < 1e-3);
    }

    #[test]
    fn time_adjustment_compounds_to_the_valuation_date() {
        let mut record = comp("C1", 100_000.0).with_attribute("age", 5.0);
        if let Some(txn) = record.transaction.as_mut() {
            txn.transaction_date = Some(date(2024, 1, 1));
        }
        let records = vec![
            PropertyRecord::subject("S").with_attribute("age", 10.0),
            record,
            comp("C2", 90.0).with_attribute("age", 15.0),
            comp("C3", 80.0).with_attribute("age", 25.0),
        ];
        let options = NormalizationOptions {
            valuation_date: Some(date(2025, 1, 1)),
            annual_market_trend_pct: 6.0,
            area_attribute: None,
        };

        let dataset = normalize_records(&records, &variables(), &options).expect("normalises");
        let price = dataset.comparables[0].price.as_ref().expect("priced");
        assert!((price.time_adjusted - 106_000.0).abs() < 100.0);
        assert!(dataset.comparables[1]
            .price
            .as_ref()
            .is_some_and(|p| p.months_elapsed.is_none() && p.time_adjusted == p.cash_equivalent));
    }

    #[test]
    fn concessions_above_the_price_exclude_the_sale() {
        let mut generous = comp("C4", 50.0).with_attribute("age", 20.0);
        if let Some(txn) = generous.transaction.as_mut() {
            txn.concessions = 80.0;
        }
        let records = vec![
            PropertyRecord::subject("S").with_attribute("age", 10.0),
            comp("C1", 300.0).with_attribute("age", 5.0),
            comp("C2", 200.0).with_attribute("age", 15.0),
            comp("C3", 100.0).with_attribute("age", 25.0),
            generous,
        ];

        let dataset = normalize_records(&records, &variables(), &NormalizationOptions::default())
            .expect("normalises");
        assert_eq!(dataset.comparables.len(), 3);
        assert_eq!(dataset.exclusions.len(), 1);
        assert_eq!(dataset.exclusions[0].property, PropertyId::from("C4"));
        assert_eq!(
            dataset.exclusions[0].reason,
            ExclusionReason::NonPositiveAdjustedPrice
        );
        assert!(dataset
            .comparables
            .iter()
            .filter_map(|property| property.price.as_ref())
            .all(|price| price.time_adjusted > 0.0));
    }

    #[test]
    fn market_trend_at_or_below_minus_one_hundred_is_rejected() {
        let records = vec![
            PropertyRecord::subject("S").with_attribute("age", 10.0),
            comp("C1", 300.0).with_attribute("age", 5.0),
            comp("C2", 200.0).with_attribute("age", 15.0),
            comp("C3", 100.0).with_attribute("age", 25.0),
        ];
        for trend in [-100.0, -150.0, f64::NAN] {
            let options = NormalizationOptions {
                valuation_date: Some(date(2025, 1, 1)),
                annual_market_trend_pct: trend,
                area_attribute: None,
            };
            let err = normalize_records(&records, &variables(), &options)
                .expect_err("trend leaves no positive price");
            assert!(matches!(
                err,
                crate::valuation::ValuationError::Input(InputError::InvalidMarketTrend(_))
            ));
        }
    }
}
