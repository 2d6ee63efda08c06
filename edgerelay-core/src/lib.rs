//! Core telemetry pipeline for EdgeRelay
//!
//! Turns noisy sensor samples into one trusted reading per collection window
//! and prepares readings for delivery.
//!
//! Stages:
//! - [`filter`]: scalar Kalman filter, one per measurement per window
//! - [`aggregator`]: samples sensors over a window, validates and reduces
//! - [`splitter`]: cuts reading backlogs into byte-bounded batches
//!
//! ```no_run
//! use edgerelay_core::{
//!     LogContext, Measurement, NoiseFilterConfig, ReductionPolicy, SamplingAggregator,
//!     SensorTable,
//! };
//! use std::time::Duration;
//!
//! # async fn window(mut sensors: SensorTable) {
//! let log = LogContext::new("device7");
//! let aggregator = SamplingAggregator::new(
//!     NoiseFilterConfig::default(),
//!     ReductionPolicy::default(),
//!     log.scoped("aggregator"),
//! );
//!
//! let reading = aggregator
//!     .collect(
//!         &mut sensors,
//!         &[Measurement::Temperature, Measurement::Humidity],
//!         Duration::from_secs(60),
//!         Duration::from_secs(1),
//!     )
//!     .await;
//! # }
//! ```

#![deny(unsafe_code)]

pub mod aggregator;
pub mod context;
pub mod errors;
pub mod filter;
pub mod reading;
pub mod sensor;
pub mod splitter;

// Public API
pub use aggregator::{ReductionPolicy, SamplingAggregator, WarmupPolicy, Window};
pub use context::LogContext;
pub use errors::{SensorError, SensorResult};
pub use filter::{NoiseFilter, NoiseFilterConfig};
pub use reading::{Measurement, MeasurementKind, Reading, Sample, UnknownMeasurement, Value};
pub use sensor::{Sensor, SensorReadout, SensorTable, StaticSensor, TableError};
pub use splitter::{BatchSplitter, DEFAULT_BATCH_CEILING};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
