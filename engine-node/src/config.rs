//! Process configuration: a typed view over the recognized configuration
//! schema, loaded from TOML plus `ENGINE__*` environment overrides.
//!
//! Grounded on `mitigation-node/src/config.rs`'s `MitigationConfig::from_file`
//! — layered `config::File` + `config::Environment` sources collapsed into
//! one typed struct via `try_deserialize`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_detector_type")]
    pub detector_type: String,
    #[serde(default)]
    pub sensitivity: f64,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub window_size: usize,
    #[serde(default)]
    pub min_data_points: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub data_collection: DataCollectionConfig,
    #[serde(default)]
    pub alerting: AlertingSectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

fn default_detector_type() -> String {
    "zscore".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCollectionConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_buffer_size() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

impl Default for DataCollectionConfig {
    fn default() -> Self {
        Self { buffer_size: default_buffer_size(), flush_interval_ms: default_flush_interval_ms() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingSectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_per_minute")]
    pub max_alerts_per_minute: u32,
    #[serde(default = "default_max_per_hour")]
    pub max_alerts_per_hour: u32,
}

fn default_max_per_minute() -> u32 {
    60
}

fn default_max_per_hour() -> u32 {
    1000
}

impl Default for AlertingSectionConfig {
    fn default() -> Self {
        Self { enabled: true, max_alerts_per_minute: default_max_per_minute(), max_alerts_per_hour: default_max_per_hour() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detector_type: default_detector_type(),
            sensitivity: 0.5,
            threshold: 3.0,
            window_size: 100,
            min_data_points: 30,
            seed: 0,
            data_collection: DataCollectionConfig::default(),
            alerting: AlertingSectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("ENGINE").separator("__"))
            .build()?;
        settings.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.detector_type.is_empty() {
            return Err("detectorType cannot be empty".into());
        }
        if self.alerting.max_alerts_per_minute == 0 {
            return Err("alerting.maxAlertsPerMinute must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }
}
