//! Agent configuration
//!
//! The agent reads one TOML file at startup. Every tunable has a default, so a
//! minimal file only names the device, its measurements, the broker and the
//! sensors:
//!
//! ```toml
//! device = "device7"
//!
//! [sampling]
//! measurements = ["temperature", "humidity"]
//!
//! [broker]
//! host = "broker.example.com"
//!
//! [[sensors]]
//! kind = "simulated"
//! name = "sim"
//! base = { temperature = 21.0, humidity = 45.0 }
//! ```
//!
//! Loading validates the file as a whole. A config that would start a pipeline
//! which can never produce a valid reading is rejected before anything runs.

use edgerelay_connectors::{MqttConfig, ProbeConfig};
use edgerelay_core::{
    Measurement, MeasurementKind, NoiseFilterConfig, ReductionPolicy, WarmupPolicy,
    DEFAULT_BATCH_CEILING,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration object
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Device identity; names the buffer table and goes into every payload
    pub device: String,
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub filter: NoiseFilterConfig,
    pub broker: MqttConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub reachability: ProbeConfig,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

/// Collection window settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplingConfig {
    pub measurements: Vec<Measurement>,
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    /// Time between the starts of consecutive windows
    #[serde(default = "default_period")]
    pub period_secs: u64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default)]
    pub warmup: WarmupPolicy,
}

fn default_window() -> u64 {
    60
}

fn default_sample_interval() -> u64 {
    1000
}

fn default_period() -> u64 {
    300
}

fn default_min_samples() -> usize {
    edgerelay_core::aggregator::DEFAULT_MIN_SAMPLES
}

impl SamplingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn policy(&self) -> ReductionPolicy {
        ReductionPolicy::default()
            .with_min_samples(self.min_samples)
            .with_warmup(self.warmup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_path")]
    pub path: PathBuf,
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("edgerelay.sqlite3")
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: default_buffer_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    /// Upper bound on one published batch, in encoded bytes
    #[serde(default = "default_ceiling")]
    pub batch_ceiling_bytes: usize,
}

fn default_ceiling() -> usize {
    DEFAULT_BATCH_CEILING
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_ceiling_bytes: default_ceiling(),
        }
    }
}

/// Reference sensor definitions
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorConfig {
    /// Numeric value read from a file, e.g. a thermal zone
    Sysfs(SysfsConfig),
    /// Noisy random walk around fixed base values
    Simulated(SimulatedConfig),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SysfsConfig {
    pub name: String,
    pub measurement: Measurement,
    pub path: PathBuf,
    /// Multiplier applied to the raw file value
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_scale() -> f64 {
    1.0
}

fn default_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulatedConfig {
    pub name: String,
    /// Standard deviation of per-sample noise
    #[serde(default = "default_noise")]
    pub noise: f64,
    /// Numeric measurements and the value they hover around
    #[serde(default)]
    pub base: BTreeMap<Measurement, f64>,
    /// Label measurements and the labels they pick from
    #[serde(default)]
    pub labels: BTreeMap<Measurement, Vec<String>>,
}

fn default_noise() -> f64 {
    0.5
}

impl SensorConfig {
    pub fn name(&self) -> &str {
        match self {
            SensorConfig::Sysfs(config) => &config.name,
            SensorConfig::Simulated(config) => &config.name,
        }
    }

    /// Measurements this sensor provides
    pub fn measurements(&self) -> Vec<Measurement> {
        match self {
            SensorConfig::Sysfs(config) => vec![config.measurement],
            SensorConfig::Simulated(config) => config
                .base
                .keys()
                .chain(config.labels.keys())
                .copied()
                .collect(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            SensorConfig::Sysfs(config) => {
                if config.measurement.kind() != MeasurementKind::Numeric {
                    return Err(invalid(format!(
                        "sysfs sensor {} cannot provide label measurement {}",
                        config.name, config.measurement
                    )));
                }
                if config.attempts == 0 {
                    return Err(invalid(format!(
                        "sysfs sensor {} needs at least one attempt",
                        config.name
                    )));
                }
            }
            SensorConfig::Simulated(config) => {
                if let Some(m) = config.base.keys().find(|m| m.kind() != MeasurementKind::Numeric) {
                    return Err(invalid(format!(
                        "simulated sensor {}: {m} takes labels, not a base value",
                        config.name
                    )));
                }
                if let Some(m) = config.labels.keys().find(|m| m.kind() != MeasurementKind::Label) {
                    return Err(invalid(format!(
                        "simulated sensor {}: {m} is numeric, give it a base value",
                        config.name
                    )));
                }
                if let Some((m, _)) = config.labels.iter().find(|(_, labels)| labels.is_empty()) {
                    return Err(invalid(format!(
                        "simulated sensor {}: no labels for {m}",
                        config.name
                    )));
                }
                if !(config.noise.is_finite() && config.noise >= 0.0) {
                    return Err(invalid(format!(
                        "simulated sensor {}: noise must be a non-negative number",
                        config.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

impl AgentConfig {
    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse and validate config text
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.trim().is_empty() {
            return Err(invalid("device must not be empty"));
        }

        let sampling = &self.sampling;
        if sampling.measurements.is_empty() {
            return Err(invalid("sampling.measurements must name at least one measurement"));
        }
        let mut seen = Vec::with_capacity(sampling.measurements.len());
        for &m in &sampling.measurements {
            if seen.contains(&m) {
                return Err(invalid(format!("{m} is listed twice in sampling.measurements")));
            }
            seen.push(m);
        }
        if sampling.sample_interval_ms == 0 {
            return Err(invalid("sampling.sample_interval_ms must be positive"));
        }
        if sampling.window() < sampling.sample_interval() {
            return Err(invalid("sampling.window_secs must cover at least one sample interval"));
        }
        if self.delivery.batch_ceiling_bytes == 0 {
            return Err(invalid("delivery.batch_ceiling_bytes must be positive"));
        }
        let limit = self.broker.max_batch_ceiling(&self.device);
        if self.delivery.batch_ceiling_bytes > limit {
            return Err(invalid(format!(
                "delivery.batch_ceiling_bytes must not exceed {limit}, the largest batch one \
                 MQTT packet can carry for this device and topic"
            )));
        }

        let mut sources: BTreeMap<Measurement, &str> = BTreeMap::new();
        for sensor in &self.sensors {
            sensor.validate()?;
            for m in sensor.measurements() {
                if let Some(first) = sources.insert(m, sensor.name()) {
                    return Err(invalid(format!(
                        "{m} is provided by both {first} and {}",
                        sensor.name()
                    )));
                }
            }
        }
        for m in &sampling.measurements {
            if !sources.contains_key(m) {
                return Err(invalid(format!("{m} is not provided by any sensor")));
            }
        }

        Ok(())
    }

    /// Broker settings with the device defaults filled in
    pub fn broker(&self) -> MqttConfig {
        self.broker
            .clone()
            .batch_ceiling(self.delivery.batch_ceiling_bytes)
    }
}
