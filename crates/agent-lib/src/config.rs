//! Agent configuration
//!
//! Layered: built-in defaults, then an optional TOML file, then
//! `SYSMON_<SECTION>_<KEY>` environment overrides. Unrecognized keys in
//! the file are rejected so typos fail at startup instead of silently
//! falling back to defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors, fatal at startup only.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] config::ConfigError),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("invalid environment override {var}: {reason}")]
    Env { var: String, reason: String },
}

/// Metrics sampling and ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SamplingConfig {
    /// Tick cadence in seconds.
    pub rate_seconds: f64,
    /// Writer batch target.
    pub batch_size: usize,
    /// Ingress queue capacity before drop-oldest kicks in.
    pub max_queue_size: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rate_seconds: 1.0,
            batch_size: 100,
            max_queue_size: 10_000,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    pub db_path: String,
    pub retention_days: u32,
    /// WAL auto-checkpoint interval in pages.
    pub wal_checkpoint_interval: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "sysmon.db".to_string(),
            retention_days: 30,
            wal_checkpoint_interval: 1000,
        }
    }
}

/// Anomaly detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AnomalyConfig {
    /// Assumed anomaly fraction in the baseline window.
    pub contamination: f64,
    pub n_estimators: usize,
    pub max_samples: usize,
    pub baseline_window_days: u32,
    /// Calibration target false-positive rate.
    pub target_fpr: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            contamination: 0.05,
            n_estimators: 100,
            max_samples: 256,
            baseline_window_days: 7,
            target_fpr: 0.05,
        }
    }
}

/// Forecaster algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastAlgo {
    Linear,
    Gbrt,
}

/// Forecasting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ForecastConfig {
    pub horizon_hours: u32,
    pub algo: ForecastAlgo,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon_hours: 72,
            algo: ForecastAlgo::Linear,
        }
    }
}

/// Breach thresholds per metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThresholdConfig {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub swap_pct: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_pct: 90.0,
            mem_pct: 90.0,
            disk_pct: 85.0,
            swap_pct: 80.0,
        }
    }
}

/// Feature window sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FeatureConfig {
    pub short_window: usize,
    pub long_window: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            short_window: 5,
            long_window: 30,
        }
    }
}

/// Rule engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuleConfig {
    /// Per-rule mute window after firing.
    pub cooldown_seconds: u64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 300,
        }
    }
}

/// Master configuration snapshot, constructed once at startup and passed
/// explicitly to subsystems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentConfig {
    pub sampling: SamplingConfig,
    pub storage: StorageConfig,
    pub anomaly: AnomalyConfig,
    pub forecast: ForecastConfig,
    pub thresholds: ThresholdConfig,
    pub features: FeatureConfig,
    pub rules: RuleConfig,
}

impl AgentConfig {
    /// Load configuration from an optional TOML file plus environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }
        let mut cfg: AgentConfig = builder.build()?.try_deserialize()?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `SYSMON_<SECTION>_<KEY>` overrides. Each recognized variable
    /// is parsed into its typed field; anything unparsable is an error.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            match std::env::var(var) {
                Ok(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::Env {
                    var: var.to_string(),
                    reason: e.to_string(),
                }),
                Err(_) => Ok(None),
            }
        }

        if let Some(v) = parse("SYSMON_SAMPLING_RATE_SECONDS")? {
            self.sampling.rate_seconds = v;
        }
        if let Some(v) = parse("SYSMON_SAMPLING_BATCH_SIZE")? {
            self.sampling.batch_size = v;
        }
        if let Some(v) = parse("SYSMON_SAMPLING_MAX_QUEUE_SIZE")? {
            self.sampling.max_queue_size = v;
        }
        if let Some(v) = parse::<String>("SYSMON_STORAGE_DB_PATH")? {
            self.storage.db_path = v;
        }
        if let Some(v) = parse("SYSMON_STORAGE_RETENTION_DAYS")? {
            self.storage.retention_days = v;
        }
        if let Some(v) = parse("SYSMON_STORAGE_WAL_CHECKPOINT_INTERVAL")? {
            self.storage.wal_checkpoint_interval = v;
        }
        if let Some(v) = parse("SYSMON_ANOMALY_CONTAMINATION")? {
            self.anomaly.contamination = v;
        }
        if let Some(v) = parse("SYSMON_ANOMALY_N_ESTIMATORS")? {
            self.anomaly.n_estimators = v;
        }
        if let Some(v) = parse("SYSMON_ANOMALY_MAX_SAMPLES")? {
            self.anomaly.max_samples = v;
        }
        if let Some(v) = parse("SYSMON_ANOMALY_BASELINE_WINDOW_DAYS")? {
            self.anomaly.baseline_window_days = v;
        }
        if let Some(v) = parse("SYSMON_ANOMALY_TARGET_FPR")? {
            self.anomaly.target_fpr = v;
        }
        if let Some(v) = parse("SYSMON_FORECAST_HORIZON_HOURS")? {
            self.forecast.horizon_hours = v;
        }
        if let Some(raw) = parse::<String>("SYSMON_FORECAST_ALGO")? {
            self.forecast.algo = match raw.as_str() {
                "linear" => ForecastAlgo::Linear,
                "gbrt" => ForecastAlgo::Gbrt,
                other => {
                    return Err(ConfigError::Env {
                        var: "SYSMON_FORECAST_ALGO".to_string(),
                        reason: format!("expected 'linear' or 'gbrt', got '{other}'"),
                    })
                }
            };
        }
        if let Some(v) = parse("SYSMON_THRESHOLDS_CPU_PCT")? {
            self.thresholds.cpu_pct = v;
        }
        if let Some(v) = parse("SYSMON_THRESHOLDS_MEM_PCT")? {
            self.thresholds.mem_pct = v;
        }
        if let Some(v) = parse("SYSMON_THRESHOLDS_DISK_PCT")? {
            self.thresholds.disk_pct = v;
        }
        if let Some(v) = parse("SYSMON_THRESHOLDS_SWAP_PCT")? {
            self.thresholds.swap_pct = v;
        }
        if let Some(v) = parse("SYSMON_FEATURES_SHORT_WINDOW")? {
            self.features.short_window = v;
        }
        if let Some(v) = parse("SYSMON_FEATURES_LONG_WINDOW")? {
            self.features.long_window = v;
        }
        if let Some(v) = parse("SYSMON_RULES_COOLDOWN_SECONDS")? {
            self.rules.cooldown_seconds = v;
        }

        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                key: key.to_string(),
                reason: reason.into(),
            }
        }

        if !self.sampling.rate_seconds.is_finite() || self.sampling.rate_seconds <= 0.0 {
            return Err(invalid("sampling.rate_seconds", "must be > 0"));
        }
        if self.sampling.batch_size == 0 {
            return Err(invalid("sampling.batch_size", "must be > 0"));
        }
        if self.sampling.max_queue_size == 0 {
            return Err(invalid("sampling.max_queue_size", "must be > 0"));
        }
        if self.storage.db_path.is_empty() {
            return Err(invalid("storage.db_path", "must not be empty"));
        }
        if !(0.0..=0.5).contains(&self.anomaly.contamination) {
            return Err(invalid("anomaly.contamination", "must be in [0, 0.5]"));
        }
        if self.anomaly.n_estimators == 0 {
            return Err(invalid("anomaly.n_estimators", "must be > 0"));
        }
        if self.anomaly.max_samples < 2 {
            return Err(invalid("anomaly.max_samples", "must be >= 2"));
        }
        if !(self.anomaly.target_fpr > 0.0 && self.anomaly.target_fpr < 1.0) {
            return Err(invalid("anomaly.target_fpr", "must be in (0, 1)"));
        }
        if self.forecast.horizon_hours == 0 {
            return Err(invalid("forecast.horizon_hours", "must be > 0"));
        }
        if self.features.short_window < 2 {
            return Err(invalid("features.short_window", "must be >= 2"));
        }
        if self.features.long_window <= self.features.short_window {
            return Err(invalid(
                "features.long_window",
                "must be greater than features.short_window",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.sampling.batch_size, 100);
        assert_eq!(cfg.sampling.max_queue_size, 10_000);
        assert_eq!(cfg.storage.retention_days, 30);
        assert_eq!(cfg.anomaly.n_estimators, 100);
        assert_eq!(cfg.forecast.algo, ForecastAlgo::Linear);
        assert_eq!(cfg.thresholds.cpu_pct, 90.0);
        assert_eq!(cfg.features.long_window, 30);
        assert_eq!(cfg.rules.cooldown_seconds, 300);
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[sampling]\nrate_seconds = 2.5\n\n[storage]\nretention_days = 7\n"
        )
        .unwrap();
        let cfg = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.sampling.rate_seconds, 2.5);
        assert_eq!(cfg.storage.retention_days, 7);
        // Untouched sections keep defaults.
        assert_eq!(cfg.sampling.batch_size, 100);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[sampling]\nrate_secconds = 2.5\n").unwrap();
        assert!(AgentConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut cfg = AgentConfig::default();
        cfg.sampling.rate_seconds = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.features.long_window = 3;
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.anomaly.target_fpr = 1.5;
        assert!(cfg.validate().is_err());
    }
}
