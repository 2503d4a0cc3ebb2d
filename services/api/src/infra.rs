use chrono::NaiveDate;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

/// Accepts a fraction (`0.4`) or a percentage (`40%`).
pub(crate) fn parse_share(raw: &str) -> Result<f64, String> {
    let trimmed = raw.trim();
    let value = match trimmed.strip_suffix('%') {
        Some(pct) => pct.trim().parse::<f64>().map(|value| value / 100.0),
        None => trimmed.parse::<f64>(),
    }
    .map_err(|err| format!("failed to parse '{raw}' as a share ({err})"))?;

    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("share '{raw}' must lie between 0 and 1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_accept_fractions_and_percentages() {
        assert_eq!(parse_share("0.25"), Ok(0.25));
        assert_eq!(parse_share("40%"), Ok(0.4));
        assert!(parse_share("1.5").is_err());
        assert!(parse_date("2024-13-01").is_err());
    }
}
