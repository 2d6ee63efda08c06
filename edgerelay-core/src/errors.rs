//! Error Types for Sampling Failures
//!
//! ## Error Categories
//!
//! Sampling errors are always local to one measurement on one tick. They are
//! recorded and logged by the aggregator, and the window carries on:
//!
//! - `Unavailable`: the sensor reported no value for the measurement
//! - `NonFinite`: the sensor produced NaN or infinity, which the filter cannot take
//! - `KindMismatch`: a label arrived for a numeric measurement or vice versa
//! - `Io`: a reference sensor could not read its source after retrying
//!
//! Window-level insufficiency is not an error: the reading degrades to
//! all-unavailable and the aggregator logs a warning.
//!
//! ## Error Handling Strategy
//!
//! ```rust
//! use edgerelay_core::{Measurement, SensorError};
//!
//! fn describe(error: &SensorError) -> &'static str {
//!     match error {
//!         SensorError::Unavailable { .. } => "sensor offline or not ready",
//!         SensorError::NonFinite { .. } => "sensor glitch",
//!         SensorError::KindMismatch { .. } => "sensor table miswired",
//!         SensorError::Io { .. } => "driver read failed",
//!     }
//! }
//! # let _ = describe(&SensorError::Unavailable { measurement: Measurement::Light });
//! ```

use crate::reading::Measurement;
use thiserror::Error;

/// Result type for sensor reads
pub type SensorResult<T> = Result<T, SensorError>;

/// Per-measurement sampling failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    /// Sensor returned no value for this measurement
    #[error("{measurement} unavailable")]
    Unavailable { measurement: Measurement },

    /// NaN or infinite sample
    #[error("{measurement} produced non-finite value {value}")]
    NonFinite { measurement: Measurement, value: f64 },

    /// Sample kind does not match the measurement kind
    #[error("{measurement} produced a sample of the wrong kind")]
    KindMismatch { measurement: Measurement },

    /// Driver I/O failed after retries
    #[error("{sensor}: {reason}")]
    Io { sensor: String, reason: String },
}
