use chrono::NaiveDate;
use clap::{Args, ValueEnum};
use ordinal_valuation::config::AppConfig;
use ordinal_valuation::error::AppError;
use ordinal_valuation::import::{
    load_calibrated_weights, load_variables, HistoryImporter, RecordImporter,
};
use ordinal_valuation::telemetry;
use ordinal_valuation::valuation::{
    calibrate, AnalysisRequest, CalibrationSettings, InputError, MappingMethod,
    PropertyTypeProfile, ReconciliationPolicy, ValuationEngine, ValuationError, WeightSelection,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum MethodArg {
    Interpolation,
    Regression,
    #[default]
    Both,
}

impl From<MethodArg> for MappingMethod {
    fn from(value: MethodArg) -> Self {
        match value {
            MethodArg::Interpolation => MappingMethod::Interpolation,
            MethodArg::Regression => MappingMethod::Regression,
            MethodArg::Both => MappingMethod::Both,
        }
    }
}

#[derive(Args, Debug)]
pub(crate) struct AnalyzeArgs {
    /// CSV with one subject row and the comparable sales
    #[arg(long)]
    pub(crate) records: PathBuf,
    /// JSON array of variable declarations (name, direction, scoring)
    #[arg(long)]
    pub(crate) variables: PathBuf,
    /// Weight preset: industrial, office, logistics, retail or multifamily
    #[arg(long, default_value = "industrial", conflicts_with = "calibrated")]
    pub(crate) profile: String,
    /// Calibrated weight artifact produced by `calibrate`
    #[arg(long)]
    pub(crate) calibrated: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = MethodArg::Both)]
    pub(crate) method: MethodArg,
    /// Valuation date (YYYY-MM-DD) for time adjustment of sale prices
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) valuation_date: Option<NaiveDate>,
    /// Map on price per unit of this attribute instead of total price
    #[arg(long)]
    pub(crate) area_attribute: Option<String>,
    /// Extrapolate (low confidence) when the subject score is outside the comparable range
    #[arg(long)]
    pub(crate) allow_extrapolation: bool,
    /// Fixed interpolation share for reconciliation (e.g. 0.6 or 60%); defaults to
    /// confidence-weighted blending
    #[arg(long, value_parser = crate::infra::parse_share)]
    pub(crate) interpolation_share: Option<f64>,
    /// Write the JSON analysis here instead of stdout
    #[arg(long)]
    pub(crate) output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub(crate) struct CalibrateArgs {
    /// CSV of historical rank columns plus `sale_price` or `won`
    #[arg(long)]
    pub(crate) history: PathBuf,
    /// Preset used as the prior
    #[arg(long, default_value = "industrial")]
    pub(crate) profile: String,
    /// Artifact version to stamp
    #[arg(long, default_value_t = 1)]
    pub(crate) version: u32,
    /// Bootstrap seed; identical seeds reproduce identical bands
    #[arg(long, default_value_t = CalibrationSettings::default().seed)]
    pub(crate) seed: u64,
    #[arg(long, default_value_t = CalibrationSettings::default().bootstrap_samples)]
    pub(crate) bootstrap_samples: usize,
    /// Largest shift any weight may make from the prior, in percentage points
    #[arg(long, default_value_t = CalibrationSettings::default().max_shift_pct_points)]
    pub(crate) max_shift: f64,
    /// Write the JSON artifact here instead of stdout
    #[arg(long)]
    pub(crate) output: Option<PathBuf>,
}

fn preset(raw: &str) -> Result<PropertyTypeProfile, AppError> {
    PropertyTypeProfile::parse(raw)
        .ok_or_else(|| ValuationError::from(InputError::UnknownProfile(raw.to_string())).into())
}

fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, rendered)?,
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{rendered}")?;
        }
    }
    Ok(())
}

pub(crate) fn run_analyze(args: AnalyzeArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let weights = match &args.calibrated {
        Some(path) => WeightSelection::Calibrated(load_calibrated_weights(path)?),
        None => WeightSelection::Profile(preset(&args.profile)?),
    };

    let request = AnalysisRequest {
        records: RecordImporter::from_path(&args.records)?,
        variables: load_variables(&args.variables)?,
        weights,
        method: args.method.into(),
        valuation_date: args.valuation_date,
        area_attribute: args.area_attribute,
        allow_extrapolation: args.allow_extrapolation,
        reconciliation: match args.interpolation_share {
            Some(interpolation_share) => ReconciliationPolicy::Fixed {
                interpolation_share,
            },
            None => ReconciliationPolicy::ConfidenceWeighted,
        },
    };

    let engine = ValuationEngine::new(config.valuation.engine_settings());
    let analysis = engine.analyze(&request)?;
    info!(
        records = %args.records.display(),
        indicated_total = analysis.mapping.indicated_total_price,
        confidence = analysis.mapping.confidence.label(),
        findings = analysis.validation.instability_findings.len(),
        "analysis written"
    );
    write_json(&analysis, args.output.as_deref())
}

pub(crate) fn run_calibrate(args: CalibrateArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let prior = preset(&args.profile)?.resolve()?;
    let history = HistoryImporter::from_path(&args.history)?;

    // History columns decide which attributes are calibrated.
    let attributes: Vec<String> = history
        .first()
        .map(|observation| observation.ranks.keys().cloned().collect())
        .unwrap_or_default();
    let (prior, dropped) = prior.restrict_to(&attributes)?;
    if !dropped.is_empty() {
        info!(?dropped, "prior weights without history columns were dropped");
    }

    let settings = CalibrationSettings {
        version: args.version,
        seed: args.seed,
        bootstrap_samples: args.bootstrap_samples,
        max_shift_pct_points: args.max_shift,
        ..CalibrationSettings::default()
    };
    let artifact = calibrate(&prior, &history, &settings, None)?;
    write_json(&artifact, args.output.as_deref())
}
