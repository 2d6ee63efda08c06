//! Scalar Kalman Filter for Sensor Noise Reduction
//!
//! ## Overview
//!
//! Every numeric measurement stream is smoothed by a one-dimensional Kalman
//! filter before it is averaged. The filter has no control input and an identity
//! state transition: it assumes the true value is (nearly) constant over a
//! collection window and that each sample is that value plus white noise.
//!
//! ## Filter Equations
//!
//! ```text
//! Covariance prediction:  P' = P + Q
//! Kalman gain:            K  = P' / (P' + R)
//! State update:           x' = x + K·(z − x)
//! Covariance update:      P  = (1 − K)·P'
//! ```
//!
//! - `Q` (process noise) is how much the true value is allowed to drift per step
//! - `R` (measurement noise) is the sensor's variance
//! - `P` starts at a configurable initial covariance and shrinks as samples arrive
//!
//! Because `0 < K < 1` on every step, the estimate moves monotonically toward a
//! constant input without overshoot.
//!
//! ## Lifecycle
//!
//! A filter lives for exactly one collection window. The default constants assume
//! zero prior bias at window start, so the aggregator builds a fresh filter per
//! measurement per window and drops it when the window is reduced.
//!
//! ## Usage Example
//!
//! ```rust
//! use edgerelay_core::filter::{NoiseFilter, NoiseFilterConfig};
//!
//! let mut filter = NoiseFilter::new(NoiseFilterConfig::default());
//! for z in [21.2, 21.6, 21.3, 21.5] {
//!     let estimate = filter.update(z);
//!     assert!(estimate.is_finite());
//! }
//! ```

use serde::Deserialize;

/// Filter constants
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct NoiseFilterConfig {
    /// Process noise covariance (Q)
    pub process_noise: f64,
    /// Measurement noise covariance (R)
    pub measurement_noise: f64,
    /// Error covariance at window start
    pub initial_covariance: f64,
    /// Estimate at window start
    pub initial_estimate: f64,
}

impl Default for NoiseFilterConfig {
    fn default() -> Self {
        Self {
            process_noise: 1e-6,
            measurement_noise: 1e-2,
            initial_covariance: 0.1,
            initial_estimate: 0.0,
        }
    }
}

impl NoiseFilterConfig {
    /// Set process noise (higher = track changes faster)
    pub fn with_process_noise(mut self, q: f64) -> Self {
        self.process_noise = q;
        self
    }

    /// Set measurement noise (higher = trust samples less)
    pub fn with_measurement_noise(mut self, r: f64) -> Self {
        self.measurement_noise = r;
        self
    }

    pub fn with_initial_covariance(mut self, p: f64) -> Self {
        self.initial_covariance = p;
        self
    }

    pub fn with_initial_estimate(mut self, x: f64) -> Self {
        self.initial_estimate = x;
        self
    }
}

/// One-dimensional recursive estimator
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    /// Current estimate (x)
    estimate: f64,
    /// Current error covariance (P)
    covariance: f64,
    process_noise: f64,
    measurement_noise: f64,
}

impl NoiseFilter {
    pub fn new(config: NoiseFilterConfig) -> Self {
        Self {
            estimate: config.initial_estimate,
            covariance: config.initial_covariance,
            process_noise: config.process_noise,
            measurement_noise: config.measurement_noise,
        }
    }

    /// Fold one measurement into the estimate and return the new estimate
    ///
    /// `measurement` must be finite.
    pub fn update(&mut self, measurement: f64) -> f64 {
        debug_assert!(measurement.is_finite(), "filter fed a non-finite sample");

        let predicted = self.covariance + self.process_noise;
        let gain = predicted / (predicted + self.measurement_noise);

        self.estimate += gain * (measurement - self.estimate);
        self.covariance = (1.0 - gain) * predicted;

        self.estimate
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn covariance(&self) -> f64 {
        self.covariance
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new(NoiseFilterConfig::default())
    }
}
