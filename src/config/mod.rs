use crate::valuation::{
    DistanceMeasure, EngineSettings, HybridRankDistance, ValidationOptions,
};
use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub valuation: ValuationConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            valuation: ValuationConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Engine tuning shared by every analysis the process runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuationConfig {
    pub sensitivity_bound_pct: f64,
    pub perturbation_pct: f64,
    pub interpolation_max_comparables: usize,
    pub loo_parallel_threshold: usize,
    pub annual_market_trend_pct: f64,
    pub hybrid_rank_share: f64,
    pub hybrid_z_cap: f64,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            sensitivity_bound_pct: 5.0,
            perturbation_pct: 10.0,
            interpolation_max_comparables: 7,
            loo_parallel_threshold: 16,
            annual_market_trend_pct: 0.0,
            hybrid_rank_share: 0.5,
            hybrid_z_cap: 2.0,
        }
    }
}

impl ValuationConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            sensitivity_bound_pct: read_number(
                "VALUATION_SENSITIVITY_BOUND_PCT",
                defaults.sensitivity_bound_pct,
            )?,
            perturbation_pct: read_number("VALUATION_PERTURBATION_PCT", defaults.perturbation_pct)?,
            interpolation_max_comparables: read_number(
                "VALUATION_INTERPOLATION_MAX_COMPARABLES",
                defaults.interpolation_max_comparables,
            )?,
            loo_parallel_threshold: read_number(
                "VALUATION_LOO_PARALLEL_THRESHOLD",
                defaults.loo_parallel_threshold,
            )?,
            annual_market_trend_pct: read_market_trend(defaults.annual_market_trend_pct)?,
            hybrid_rank_share: read_number("VALUATION_HYBRID_RANK_SHARE", defaults.hybrid_rank_share)?,
            hybrid_z_cap: read_number("VALUATION_HYBRID_Z_CAP", defaults.hybrid_z_cap)?,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            hybrid: HybridRankDistance {
                rank_share: self.hybrid_rank_share,
                measure: DistanceMeasure::ZScore {
                    cap: self.hybrid_z_cap,
                },
            },
            annual_market_trend_pct: self.annual_market_trend_pct,
            interpolation_max_comparables: self.interpolation_max_comparables,
            validation: ValidationOptions {
                sensitivity_bound_pct: self.sensitivity_bound_pct,
                perturbation_pct: self.perturbation_pct,
                loo_parallel_threshold: self.loo_parallel_threshold,
                ..ValidationOptions::default()
            },
        }
    }
}

fn read_number<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { key }),
        _ => Ok(default),
    }
}

/// A trend at or below -100% a year would wipe out every dated price.
fn read_market_trend(default: f64) -> Result<f64, ConfigError> {
    const KEY: &str = "VALUATION_ANNUAL_MARKET_TREND_PCT";
    let trend: f64 = read_number(KEY, default)?;
    if trend.is_finite() && trend > -100.0 {
        Ok(trend)
    } else {
        Err(ConfigError::InvalidNumber { key: KEY })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { key: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key } => write!(f, "{key} must be a valid number"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidNumber { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for key in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "VALUATION_SENSITIVITY_BOUND_PCT",
            "VALUATION_PERTURBATION_PCT",
            "VALUATION_INTERPOLATION_MAX_COMPARABLES",
            "VALUATION_LOO_PARALLEL_THRESHOLD",
            "VALUATION_ANNUAL_MARKET_TREND_PCT",
            "VALUATION_HYBRID_RANK_SHARE",
            "VALUATION_HYBRID_Z_CAP",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.valuation, ValuationConfig::default());
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn valuation_overrides_flow_into_engine_settings() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("VALUATION_SENSITIVITY_BOUND_PCT", "7.5");
        env::set_var("VALUATION_LOO_PARALLEL_THRESHOLD", "4");
        env::set_var("VALUATION_HYBRID_Z_CAP", "3");
        let config = AppConfig::load().expect("config loads");
        let settings = config.valuation.engine_settings();
        reset_env();

        assert_eq!(settings.validation.sensitivity_bound_pct, 7.5);
        assert_eq!(settings.validation.loo_parallel_threshold, 4);
        assert_eq!(settings.hybrid.measure, DistanceMeasure::ZScore { cap: 3.0 });
    }

    #[test]
    fn rejects_non_numeric_valuation_settings() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("VALUATION_PERTURBATION_PCT", "ten");
        let err = AppConfig::load().expect_err("invalid number");
        reset_env();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                key: "VALUATION_PERTURBATION_PCT"
            }
        ));
    }

    #[test]
    fn rejects_market_trends_that_erase_prices() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("VALUATION_ANNUAL_MARKET_TREND_PCT", "-150");
        let err = AppConfig::load().expect_err("trend below -100%");
        reset_env();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                key: "VALUATION_ANNUAL_MARKET_TREND_PCT"
            }
        ));
    }
}
