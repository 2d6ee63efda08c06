//! Sensor Collaborators and the Measurement Routing Table
//!
//! ## Overview
//!
//! Physical drivers are opaque to the pipeline. A driver implements [`Sensor`]:
//! each call to [`Sensor::read`] returns one sample (or `None`) for each
//! measurement the device provides. Drivers retry internally and must not fail
//! past this boundary; a channel that cannot be read is reported as `None`.
//!
//! ## Static Routing
//!
//! Which sensor provides which measurement is decided once, at startup, by
//! building a [`SensorTable`]. The table is an explicit list of
//! `measurement → sensor` bindings; binding the same measurement twice is
//! rejected so every measurement has exactly one source.
//!
//! ```rust
//! use edgerelay_core::sensor::{SensorTable, StaticSensor};
//! use edgerelay_core::{Measurement, Sample};
//!
//! let bme = StaticSensor::new("bme280")
//!     .with(Measurement::Temperature, Sample::Numeric(21.0))
//!     .with(Measurement::Humidity, Sample::Numeric(40.0));
//!
//! let table = SensorTable::new()
//!     .bind(Box::new(bme), &[Measurement::Temperature, Measurement::Humidity])
//!     .unwrap();
//! assert!(table.covers(&[Measurement::Temperature]));
//! ```

use crate::reading::{Measurement, Sample};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// One read of a sensor: a sample or `None` per measurement it provides
pub type SensorReadout = HashMap<Measurement, Option<Sample>>;

/// Opaque sensor driver
#[async_trait]
pub trait Sensor: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Sample every channel once
    async fn read(&mut self) -> SensorReadout;
}

/// Errors raised while building a [`SensorTable`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("{measurement} is bound to both {first} and {second}")]
    DuplicateBinding {
        measurement: Measurement,
        first: String,
        second: String,
    },
}

/// Explicit `measurement → sensor` routing built at startup
#[derive(Default)]
pub struct SensorTable {
    sensors: Vec<Box<dyn Sensor>>,
    routes: BTreeMap<Measurement, usize>,
}

impl SensorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sensor as the source of `measurements`
    pub fn bind(
        mut self,
        sensor: Box<dyn Sensor>,
        measurements: &[Measurement],
    ) -> Result<Self, TableError> {
        let index = self.sensors.len();
        for &measurement in measurements {
            if let Some(&existing) = self.routes.get(&measurement) {
                return Err(TableError::DuplicateBinding {
                    measurement,
                    first: self.sensors[existing].name().to_string(),
                    second: sensor.name().to_string(),
                });
            }
        }
        for &measurement in measurements {
            self.routes.insert(measurement, index);
        }
        self.sensors.push(sensor);
        Ok(self)
    }

    /// True when every measurement in `measurements` has a source
    pub fn covers(&self, measurements: &[Measurement]) -> bool {
        measurements.iter().all(|m| self.routes.contains_key(m))
    }

    /// Measurements with no bound sensor
    pub fn missing(&self, measurements: &[Measurement]) -> Vec<Measurement> {
        measurements
            .iter()
            .copied()
            .filter(|m| !self.routes.contains_key(m))
            .collect()
    }

    /// Name of the sensor bound to `measurement`
    pub fn source_of(&self, measurement: Measurement) -> Option<&str> {
        self.routes
            .get(&measurement)
            .map(|&index| self.sensors[index].name())
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Read every sensor that feeds `measurements` once and route the samples
    ///
    /// Measurements with no binding, or that their sensor left out of the
    /// readout, come back as `None`.
    pub async fn sample(
        &mut self,
        measurements: &[Measurement],
    ) -> BTreeMap<Measurement, Option<Sample>> {
        let mut wanted: Vec<usize> = measurements
            .iter()
            .filter_map(|m| self.routes.get(m).copied())
            .collect();
        wanted.sort_unstable();
        wanted.dedup();

        let mut readouts: HashMap<usize, SensorReadout> = HashMap::with_capacity(wanted.len());
        for index in wanted {
            let readout = self.sensors[index].read().await;
            readouts.insert(index, readout);
        }

        measurements
            .iter()
            .map(|&m| {
                let sample = self
                    .routes
                    .get(&m)
                    .and_then(|index| readouts.get_mut(index))
                    .and_then(|readout| readout.remove(&m))
                    .flatten();
                (m, sample)
            })
            .collect()
    }
}

/// Sensor that returns fixed samples, useful for wiring checks and tests
#[derive(Debug, Clone)]
pub struct StaticSensor {
    name: String,
    samples: HashMap<Measurement, Option<Sample>>,
}

impl StaticSensor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            samples: HashMap::new(),
        }
    }

    pub fn with(mut self, measurement: Measurement, sample: Sample) -> Self {
        self.samples.insert(measurement, Some(sample));
        self
    }

    /// Report `measurement` as unavailable on every read
    pub fn without(mut self, measurement: Measurement) -> Self {
        self.samples.insert(measurement, None);
        self
    }
}

#[async_trait]
impl Sensor for StaticSensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self) -> SensorReadout {
        self.samples.clone()
    }
}
