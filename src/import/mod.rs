//! File adapters feeding the engine: property records and calibration history from CSV,
//! variable declarations and calibrated weights from JSON.

mod parser;

use crate::valuation::{CalibratedWeights, CalibrationObservation, PropertyRecord, VariableSpec};
use std::io::Read;
use std::path::Path;

#[derive(Debug)]
pub enum ImportError {
    Io(std::io::Error),
    Csv(csv::Error),
    Json(serde_json::Error),
    MissingColumn(&'static str),
    Header { column: String, message: String },
    Row { line: u64, message: String },
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::Io(err) => write!(f, "failed to read input file: {}", err),
            ImportError::Csv(err) => write!(f, "invalid CSV data: {}", err),
            ImportError::Json(err) => write!(f, "invalid JSON data: {}", err),
            ImportError::MissingColumn(column) => {
                write!(f, "required column '{}' is missing", column)
            }
            ImportError::Header { column, message } => {
                write!(f, "column '{}' is not usable: {}", column, message)
            }
            ImportError::Row { line, message } => write!(f, "line {}: {}", line, message),
        }
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImportError::Io(err) => Some(err),
            ImportError::Csv(err) => Some(err),
            ImportError::Json(err) => Some(err),
            ImportError::MissingColumn(_) | ImportError::Header { .. } | ImportError::Row { .. } => {
                None
            }
        }
    }
}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err)
    }
}

impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

/// Reads subject and comparable rows.
///
/// `id` and `role` are required. `price`, `sale_date`, `arms_length`, `rights`,
/// `concessions` and the financing columns (`loan_amount`, `contract_rate`,
/// `market_rate`, `amortization_months`, `term_months`) describe the transaction.
/// Every other column is a numeric attribute, optionally declared with a unit as
/// `building_area[sqm]`. Empty cells are missing values.
pub struct RecordImporter;

impl RecordImporter {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Vec<PropertyRecord>, ImportError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Vec<PropertyRecord>, ImportError> {
        parser::parse_records(reader)
    }
}

/// Reads historical outcomes: one rank column per attribute plus `sale_price` or `won`.
pub struct HistoryImporter;

impl HistoryImporter {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Vec<CalibrationObservation>, ImportError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Vec<CalibrationObservation>, ImportError> {
        parser::parse_history(reader)
    }
}

pub fn load_variables<P: AsRef<Path>>(path: P) -> Result<Vec<VariableSpec>, ImportError> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

pub fn load_calibrated_weights<P: AsRef<Path>>(path: P) -> Result<CalibratedWeights, ImportError> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}
