//! Reference sensor collaborators
//!
//! Real deployments plug in their own drivers through [`Sensor`]. The agent
//! ships two so it runs without hardware-specific code:
//!
//! - [`SysfsSensor`] reads a single number from a file (thermal zones, IIO
//!   channels) and scales it
//! - [`SimulatedSensor`] produces a noisy random walk around base values

use crate::config::{SensorConfig, SimulatedConfig, SysfsConfig};
use async_trait::async_trait;
use edgerelay_core::{
    LogContext, Measurement, Sample, Sensor, SensorError, SensorReadout, SensorTable, TableError,
};
use log::warn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Pause between attempts of a failed file read
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Pull toward the base value per read of a simulated channel
const REVERSION: f64 = 0.9;

/// Build the startup routing table from sensor definitions
pub fn build_table(configs: &[SensorConfig], log: &LogContext) -> Result<SensorTable, TableError> {
    let mut table = SensorTable::new();
    for config in configs {
        let sensor: Box<dyn Sensor> = match config {
            SensorConfig::Sysfs(sysfs) => Box::new(SysfsSensor::new(sysfs, log.scoped("sensor"))),
            SensorConfig::Simulated(sim) => Box::new(SimulatedSensor::new(sim)),
        };
        table = table.bind(sensor, &config.measurements())?;
    }
    Ok(table)
}

/// Numeric value read from a text file
pub struct SysfsSensor {
    name: String,
    measurement: Measurement,
    path: PathBuf,
    scale: f64,
    attempts: u32,
    log: LogContext,
}

impl SysfsSensor {
    pub fn new(config: &SysfsConfig, log: LogContext) -> Self {
        Self {
            name: config.name.clone(),
            measurement: config.measurement,
            path: config.path.clone(),
            scale: config.scale,
            attempts: config.attempts.max(1),
            log,
        }
    }

    async fn read_once(&self) -> Result<f64, SensorError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.io_error(format!("{}: {e}", self.path.display())))?;
        let raw: f64 = text
            .trim()
            .parse()
            .map_err(|e| self.io_error(format!("{}: not a number ({e})", self.path.display())))?;
        Ok(raw * self.scale)
    }

    fn io_error(&self, reason: String) -> SensorError {
        SensorError::Io {
            sensor: self.name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl Sensor for SysfsSensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self) -> SensorReadout {
        let mut last_error = None;
        for attempt in 0..self.attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            match self.read_once().await {
                Ok(value) => {
                    return HashMap::from([(self.measurement, Some(Sample::Numeric(value)))]);
                }
                Err(error) => last_error = Some(error),
            }
        }
        if let Some(error) = last_error {
            warn!(
                target: self.log.target(),
                "{error} (after {} attempts)",
                self.attempts
            );
        }
        HashMap::from([(self.measurement, None)])
    }
}

/// Random walk around fixed base values
pub struct SimulatedSensor {
    name: String,
    noise: f64,
    base: BTreeMap<Measurement, f64>,
    offsets: BTreeMap<Measurement, f64>,
    labels: BTreeMap<Measurement, Vec<String>>,
    rng: StdRng,
}

impl SimulatedSensor {
    pub fn new(config: &SimulatedConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic sensor for tests and demos
    pub fn seeded(config: &SimulatedConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &SimulatedConfig, rng: StdRng) -> Self {
        Self {
            name: config.name.clone(),
            noise: config.noise.abs(),
            base: config.base.clone(),
            offsets: config.base.keys().map(|&m| (m, 0.0)).collect(),
            labels: config.labels.clone(),
            rng,
        }
    }
}

#[async_trait]
impl Sensor for SimulatedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self) -> SensorReadout {
        let mut readout = SensorReadout::with_capacity(self.base.len() + self.labels.len());

        for (&measurement, &base) in &self.base {
            let offset = self.offsets.entry(measurement).or_insert(0.0);
            *offset = *offset * REVERSION + self.rng.gen_range(-self.noise..=self.noise);
            readout.insert(measurement, Some(Sample::Numeric(base + *offset)));
        }
        for (&measurement, choices) in &self.labels {
            let label = choices.choose(&mut self.rng).cloned().map(Sample::Label);
            readout.insert(measurement, label);
        }

        readout
    }
}
