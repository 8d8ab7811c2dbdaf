use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{DEFAULT_COMPACT_THRESHOLD, DEFAULT_HOLD_TTL, DEFAULT_SWEEP_TIMEOUT};
use crate::sweeper::{ScheduleError, parse_schedule};

pub const DEFAULT_NIGHT_AUDIT_SCHEDULE: &str = "0 0 3 * * *";
pub const DEFAULT_HOLD_CLEANUP_SCHEDULE: &str = "0 */5 * * * *";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Process configuration, read once from `ROOMLEDGER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub metrics_port: Option<u16>,
    pub hold_ttl: Duration,
    pub night_audit_schedule: String,
    pub hold_cleanup_schedule: String,
    pub sweep_timeout: Duration,
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            catalog_path: PathBuf::from("./catalog.json"),
            metrics_port: None,
            hold_ttl: DEFAULT_HOLD_TTL,
            night_audit_schedule: DEFAULT_NIGHT_AUDIT_SCHEDULE.to_string(),
            hold_cleanup_schedule: DEFAULT_HOLD_CLEANUP_SCHEDULE.to_string(),
            sweep_timeout: DEFAULT_SWEEP_TIMEOUT,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables keep their default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(dir) = get("ROOMLEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("ROOMLEDGER_CATALOG") {
            config.catalog_path = PathBuf::from(path);
        }
        config.metrics_port = parse_var(&get, "ROOMLEDGER_METRICS_PORT")?;
        if let Some(secs) = parse_var::<u64>(&get, "ROOMLEDGER_HOLD_TTL_SECS")? {
            config.hold_ttl = positive_secs("ROOMLEDGER_HOLD_TTL_SECS", secs)?;
        }
        if let Some(secs) = parse_var::<u64>(&get, "ROOMLEDGER_SWEEP_TIMEOUT_SECS")? {
            config.sweep_timeout = positive_secs("ROOMLEDGER_SWEEP_TIMEOUT_SECS", secs)?;
        }
        if let Some(threshold) = parse_var(&get, "ROOMLEDGER_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        if let Some(expr) = get("ROOMLEDGER_NIGHT_AUDIT_SCHEDULE") {
            config.night_audit_schedule = expr;
        }
        if let Some(expr) = get("ROOMLEDGER_HOLD_CLEANUP_SCHEDULE") {
            config.hold_cleanup_schedule = expr;
        }
        parse_schedule(&config.night_audit_schedule)?;
        parse_schedule(&config.hold_cleanup_schedule)?;
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomledger.wal")
    }

    pub fn hold_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hold_ttl.as_secs() as i64)
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = get(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        })
}

fn positive_secs(var: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: secs.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}
