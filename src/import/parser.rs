use super::ImportError;
use crate::valuation::{
    AttributeValue, CalibrationObservation, FinancingTerms, Outcome, PropertyId, PropertyRecord,
    PropertyRights, PropertyRole, TransactionMetadata, Unit,
};
use chrono::NaiveDate;
use csv::StringRecord;
use std::collections::BTreeMap;
use std::io::Read;

const RESERVED_COLUMNS: &[&str] = &[
    "id",
    "role",
    "price",
    "sale_date",
    "arms_length",
    "rights",
    "loan_amount",
    "contract_rate",
    "market_rate",
    "amortization_months",
    "term_months",
    "concessions",
];

/// Attribute column header: `name` or `name[unit]`.
#[derive(Debug, Clone, PartialEq)]
struct AttributeColumn {
    index: usize,
    name: String,
    unit: Option<Unit>,
}

fn attribute_column(index: usize, header: &str) -> Result<AttributeColumn, ImportError> {
    let header = header.trim();
    match header.split_once('[') {
        Some((name, rest)) => {
            let raw_unit = rest.trim_end_matches(']');
            let unit = Unit::parse(raw_unit).ok_or_else(|| ImportError::Header {
                column: header.to_string(),
                message: format!("unknown unit '{raw_unit}'"),
            })?;
            Ok(AttributeColumn {
                index,
                name: name.trim().to_string(),
                unit: Some(unit),
            })
        }
        None => Ok(AttributeColumn {
            index,
            name: header.to_string(),
            unit: None,
        }),
    }
}

struct Row<'a> {
    line: u64,
    headers: &'a StringRecord,
    record: &'a StringRecord,
}

impl Row<'_> {
    fn cell(&self, column: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|header| header.trim().eq_ignore_ascii_case(column))
            .and_then(|index| self.record.get(index))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn error(&self, message: impl Into<String>) -> ImportError {
        ImportError::Row {
            line: self.line,
            message: message.into(),
        }
    }

    fn number(&self, column: &str) -> Result<Option<f64>, ImportError> {
        self.cell(column)
            .map(|raw| parse_number(raw).ok_or_else(|| self.error(format!("{column} '{raw}' is not a number"))))
            .transpose()
    }

    fn rate(&self, column: &str) -> Result<Option<f64>, ImportError> {
        self.cell(column)
            .map(|raw| match raw.strip_suffix('%') {
                Some(pct) => parse_number(pct).map(|value| value / 100.0),
                None => parse_number(raw),
            }
            .ok_or_else(|| self.error(format!("{column} '{raw}' is not a rate"))))
            .transpose()
    }

    fn months(&self, column: &str) -> Result<Option<u32>, ImportError> {
        self.cell(column)
            .map(|raw| {
                raw.parse::<u32>()
                    .map_err(|_| self.error(format!("{column} '{raw}' is not a whole number of months")))
            })
            .transpose()
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '_'))
        .collect();
    cleaned.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

fn parse_rights(raw: &str) -> Option<PropertyRights> {
    match raw.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
        "fee_simple" => Some(PropertyRights::FeeSimple),
        "leased_fee" => Some(PropertyRights::LeasedFee),
        "leasehold" => Some(PropertyRights::Leasehold),
        "partial_interest" | "partial" => Some(PropertyRights::PartialInterest),
        _ => None,
    }
}

fn parse_role(raw: &str) -> Option<PropertyRole> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "subject" => Some(PropertyRole::Subject),
        "comparable" | "comp" => Some(PropertyRole::Comparable),
        _ => None,
    }
}

pub(crate) fn parse_records<R: Read>(reader: R) -> Result<Vec<PropertyRecord>, ImportError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();

    for required in ["id", "role"] {
        if !headers.iter().any(|header| header.eq_ignore_ascii_case(required)) {
            return Err(ImportError::MissingColumn(required));
        }
    }

    let attributes = headers
        .iter()
        .enumerate()
        .filter(|(_, header)| {
            !RESERVED_COLUMNS
                .iter()
                .any(|reserved| header.eq_ignore_ascii_case(reserved))
        })
        .map(|(index, header)| attribute_column(index, header))
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::new();
    for (offset, record) in csv_reader.records().enumerate() {
        let record = record?;
        let row = Row {
            line: offset as u64 + 2,
            headers: &headers,
            record: &record,
        };
        records.push(parse_record(&row, &attributes)?);
    }
    Ok(records)
}

fn parse_record(row: &Row<'_>, columns: &[AttributeColumn]) -> Result<PropertyRecord, ImportError> {
    let id = row.cell("id").ok_or_else(|| row.error("id is empty"))?;
    let role_raw = row.cell("role").ok_or_else(|| row.error("role is empty"))?;
    let role = parse_role(role_raw)
        .ok_or_else(|| row.error(format!("role '{role_raw}' must be subject or comparable")))?;
    let rights = match row.cell("rights") {
        Some(raw) => parse_rights(raw).ok_or_else(|| row.error(format!("unknown rights '{raw}'")))?,
        None => PropertyRights::FeeSimple,
    };

    let mut attributes = BTreeMap::new();
    for column in columns {
        let Some(raw) = row.record.get(column.index).map(str::trim).filter(|v| !v.is_empty())
        else {
            continue;
        };
        let value = parse_number(raw)
            .ok_or_else(|| row.error(format!("{} '{raw}' is not a number", column.name)))?;
        attributes.insert(
            column.name.clone(),
            AttributeValue {
                value,
                unit: column.unit,
            },
        );
    }

    let transaction = match role {
        PropertyRole::Subject => None,
        PropertyRole::Comparable => Some(parse_transaction(row)?),
    };

    Ok(PropertyRecord {
        id: PropertyId::from(id),
        role,
        attributes,
        rights,
        transaction,
    })
}

fn parse_transaction(row: &Row<'_>) -> Result<TransactionMetadata, ImportError> {
    let transaction_date = row
        .cell("sale_date")
        .map(|raw| parse_date(raw).ok_or_else(|| row.error(format!("sale_date '{raw}' must be YYYY-MM-DD"))))
        .transpose()?;
    let arms_length = match row.cell("arms_length") {
        Some(raw) => parse_bool(raw).ok_or_else(|| row.error(format!("arms_length '{raw}' must be true or false")))?,
        None => true,
    };

    let financing = match row.number("loan_amount")? {
        Some(loan_amount) if loan_amount > 0.0 => {
            let contract_rate = row
                .rate("contract_rate")?
                .ok_or_else(|| row.error("contract_rate is required with loan_amount"))?;
            let market_rate = row
                .rate("market_rate")?
                .ok_or_else(|| row.error("market_rate is required with loan_amount"))?;
            let amortization_months = row
                .months("amortization_months")?
                .ok_or_else(|| row.error("amortization_months is required with loan_amount"))?;
            FinancingTerms::BelowMarket {
                loan_amount,
                contract_rate,
                market_rate,
                amortization_months,
                term_months: row.months("term_months")?.unwrap_or(amortization_months),
            }
        }
        _ => FinancingTerms::Cash,
    };

    Ok(TransactionMetadata {
        price: row.number("price")?,
        transaction_date,
        financing,
        concessions: row.number("concessions")?.unwrap_or_default(),
        arms_length,
    })
}

pub(crate) fn parse_history<R: Read>(reader: R) -> Result<Vec<CalibrationObservation>, ImportError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();

    let outcome_column = headers
        .iter()
        .find(|header| header.eq_ignore_ascii_case("sale_price") || header.eq_ignore_ascii_case("won"))
        .map(str::to_ascii_lowercase)
        .ok_or(ImportError::MissingColumn("sale_price or won"))?;
    let rank_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, header)| {
            !header.eq_ignore_ascii_case(&outcome_column) && !header.eq_ignore_ascii_case("id")
        })
        .map(|(index, header)| (index, header.to_string()))
        .collect();

    let mut observations = Vec::new();
    for (offset, record) in csv_reader.records().enumerate() {
        let record = record?;
        let row = Row {
            line: offset as u64 + 2,
            headers: &headers,
            record: &record,
        };

        let mut ranks = BTreeMap::new();
        for (index, name) in &rank_columns {
            let raw = record.get(*index).map(str::trim).unwrap_or_default();
            let rank = parse_number(raw)
                .ok_or_else(|| row.error(format!("rank {name} '{raw}' is not a number")))?;
            ranks.insert(name.clone(), rank);
        }

        let raw = row
            .cell(&outcome_column)
            .ok_or_else(|| row.error(format!("{outcome_column} is empty")))?;
        let outcome = if outcome_column == "won" {
            Outcome::Won(parse_bool(raw).ok_or_else(|| row.error(format!("won '{raw}' must be true or false")))?)
        } else {
            Outcome::SalePrice(
                parse_number(raw).ok_or_else(|| row.error(format!("sale_price '{raw}' is not a number")))?,
            )
        };

        observations.push(CalibrationObservation { ranks, outcome });
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_suffixes_become_measured_attributes() {
        let column = attribute_column(3, "building_area[sqm]").expect("column");
        assert_eq!(column.name, "building_area");
        assert_eq!(column.unit, Some(Unit::SquareMeters));
        assert!(attribute_column(0, "site[furlongs]").is_err());
    }

    #[test]
    fn numbers_tolerate_currency_formatting() {
        assert_eq!(parse_number("$1,250,000"), Some(1_250_000.0));
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_rights("Leased Fee"), Some(PropertyRights::LeasedFee));
    }
}
