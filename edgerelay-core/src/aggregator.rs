//! Window Aggregation: Sampling, Filtering and Reduction
//!
//! ## Overview
//!
//! The aggregator turns a collection window of raw, jittery samples into one
//! [`Reading`]. For each configured measurement it:
//!
//! 1. Builds a fresh [`NoiseFilter`] at window start
//! 2. Samples the measurement once per tick until the window elapses
//! 3. Pushes every numeric sample through the filter, keeping the filtered series
//! 4. Drops the warm-up prefix and averages what remains, rounded to 2 decimals
//!
//! ```text
//!  tick:      0     1     2     3     4     5     6   …
//!  raw:     21.4  20.9  21.7  21.1  21.3  21.2  21.5
//!  filtered: 19.4  20.3  20.8  20.9  21.0  21.1  21.2
//!            └──── warm-up ────┘  └──── averaged ────┘
//! ```
//!
//! ## Validity Policy
//!
//! A window is trusted only if every measurement collected at least
//! `min_samples` samples. If any series is short the whole reading degrades to
//! unavailable for every measurement: a short window fails as a unit rather than
//! being silently interpolated.
//!
//! ## Failure Handling
//!
//! A failed read affects only that measurement on that tick. The error is
//! recorded in the [`Window`] report and the loop continues. Non-finite samples
//! and samples of the wrong kind count as failed reads.
//!
//! ## Timing
//!
//! Ticks come from `tokio::time::interval` with delayed missed-tick handling, so
//! a slow sensor stretches the gap after it instead of causing a burst of
//! catch-up reads. The window is bounded by its duration and never cancelled
//! early.

use crate::context::LogContext;
use crate::errors::SensorError;
use crate::filter::{NoiseFilter, NoiseFilterConfig};
use crate::reading::{Measurement, MeasurementKind, Reading, Sample, Value};
use crate::sensor::SensorTable;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Smallest series the default policy trusts
pub const DEFAULT_MIN_SAMPLES: usize = 5;

/// Samples discarded by the default warm-up policy
pub const DEFAULT_WARMUP_SAMPLES: usize = 4;

/// How much of the start of a filtered series is discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupPolicy {
    /// Drop a fixed number of leading samples
    DropFirst(usize),
    /// Drop the first quarter of the series (rounded down)
    Quarter,
}

impl WarmupPolicy {
    /// Number of leading samples to drop from a series of `len`
    pub fn warmup_len(self, len: usize) -> usize {
        match self {
            WarmupPolicy::DropFirst(n) => n.min(len),
            WarmupPolicy::Quarter => len / 4,
        }
    }
}

impl Default for WarmupPolicy {
    fn default() -> Self {
        WarmupPolicy::DropFirst(DEFAULT_WARMUP_SAMPLES)
    }
}

/// Validity threshold and warm-up handling for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionPolicy {
    pub min_samples: usize,
    pub warmup: WarmupPolicy,
}

impl Default for ReductionPolicy {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            warmup: WarmupPolicy::default(),
        }
    }
}

impl ReductionPolicy {
    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    pub fn with_warmup(mut self, warmup: WarmupPolicy) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn is_sufficient(&self, len: usize) -> bool {
        len >= self.min_samples
    }

    /// Average of the filtered series after warm-up, rounded to 2 decimals
    pub fn reduce_numeric(&self, filtered: &[f64]) -> Value {
        if !self.is_sufficient(filtered.len()) {
            return Value::Unavailable;
        }
        let tail = &filtered[self.warmup.warmup_len(filtered.len())..];
        if tail.is_empty() {
            return Value::Unavailable;
        }
        let mean = tail.iter().sum::<f64>() / tail.len() as f64;
        Value::Numeric(round2(mean))
    }

    /// Most frequent label after warm-up; ties go to the most recent label
    pub fn reduce_labels(&self, labels: &[String]) -> Value {
        if !self.is_sufficient(labels.len()) {
            return Value::Unavailable;
        }
        let tail = &labels[self.warmup.warmup_len(labels.len())..];

        // label -> (count, index of last occurrence)
        let mut tally: HashMap<&str, (usize, usize)> = HashMap::new();
        for (index, label) in tail.iter().enumerate() {
            let entry = tally.entry(label.as_str()).or_insert((0, index));
            entry.0 += 1;
            entry.1 = index;
        }

        tally
            .into_iter()
            .max_by_key(|(_, rank)| *rank)
            .map(|(label, _)| Value::Label(label.to_string()))
            .unwrap_or(Value::Unavailable)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Per-measurement series for the current window
enum Series {
    Numeric { filter: NoiseFilter, filtered: Vec<f64> },
    Label(Vec<String>),
}

impl Series {
    fn new(measurement: Measurement, filter: NoiseFilterConfig) -> Self {
        match measurement.kind() {
            MeasurementKind::Numeric => Series::Numeric {
                filter: NoiseFilter::new(filter),
                filtered: Vec::new(),
            },
            MeasurementKind::Label => Series::Label(Vec::new()),
        }
    }

    fn push(
        &mut self,
        measurement: Measurement,
        sample: Option<Sample>,
    ) -> Result<(), SensorError> {
        match (self, sample) {
            (_, None) => Err(SensorError::Unavailable { measurement }),
            (Series::Numeric { filter, filtered }, Some(Sample::Numeric(value))) => {
                if !value.is_finite() {
                    return Err(SensorError::NonFinite { measurement, value });
                }
                filtered.push(filter.update(value));
                Ok(())
            }
            (Series::Label(labels), Some(Sample::Label(label))) => {
                labels.push(label);
                Ok(())
            }
            _ => Err(SensorError::KindMismatch { measurement }),
        }
    }

    fn len(&self) -> usize {
        match self {
            Series::Numeric { filtered, .. } => filtered.len(),
            Series::Label(labels) => labels.len(),
        }
    }

    fn reduce(&self, policy: &ReductionPolicy) -> Value {
        match self {
            Series::Numeric { filtered, .. } => policy.reduce_numeric(filtered),
            Series::Label(labels) => policy.reduce_labels(labels),
        }
    }
}

/// Outcome of one collection window
#[derive(Debug, Clone)]
pub struct Window {
    pub reading: Reading,
    /// Accepted samples per measurement
    pub sample_counts: BTreeMap<Measurement, usize>,
    /// Failed reads, in order
    pub errors: Vec<SensorError>,
    /// Number of ticks executed
    pub ticks: usize,
}

impl Window {
    /// True when the validity policy rejected the window
    pub fn is_degraded(&self) -> bool {
        self.reading.is_degraded()
    }
}

/// Drives one noise filter per measurement over a collection window
#[derive(Debug, Clone)]
pub struct SamplingAggregator {
    filter: NoiseFilterConfig,
    policy: ReductionPolicy,
    log: LogContext,
}

impl SamplingAggregator {
    pub fn new(filter: NoiseFilterConfig, policy: ReductionPolicy, log: LogContext) -> Self {
        Self { filter, policy, log }
    }

    pub fn policy(&self) -> &ReductionPolicy {
        &self.policy
    }

    /// Collect one window and return its reading
    pub async fn collect(
        &self,
        sensors: &mut SensorTable,
        measurements: &[Measurement],
        duration: Duration,
        sample_interval: Duration,
    ) -> Reading {
        self.collect_window(sensors, measurements, duration, sample_interval)
            .await
            .reading
    }

    /// Collect one window and return the reading with its sampling report
    pub async fn collect_window(
        &self,
        sensors: &mut SensorTable,
        measurements: &[Measurement],
        duration: Duration,
        sample_interval: Duration,
    ) -> Window {
        let mut series: BTreeMap<Measurement, Series> = measurements
            .iter()
            .map(|&m| (m, Series::new(m, self.filter)))
            .collect();
        let wanted: Vec<Measurement> = series.keys().copied().collect();
        let mut errors = Vec::new();
        let mut ticks = 0;

        let start = Instant::now();
        let mut ticker = time::interval(sample_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if start.elapsed() >= duration {
                break;
            }
            ticks += 1;

            for (measurement, sample) in sensors.sample(&wanted).await {
                let Some(entry) = series.get_mut(&measurement) else {
                    continue;
                };
                if let Err(error) = entry.push(measurement, sample) {
                    log::debug!(target: self.log.target(), "tick {}: {}", ticks, error);
                    errors.push(error);
                }
            }
        }

        let sample_counts: BTreeMap<Measurement, usize> =
            series.iter().map(|(m, s)| (*m, s.len())).collect();
        self.log_failures(&errors);

        let time = Utc::now();
        let short: Vec<_> = sample_counts
            .iter()
            .filter(|(_, count)| !self.policy.is_sufficient(**count))
            .collect();

        let reading = if !short.is_empty() {
            for (measurement, count) in &short {
                log::warn!(
                    target: self.log.target(),
                    "window degraded: {} has {} samples, need {}",
                    measurement,
                    count,
                    self.policy.min_samples
                );
            }
            Reading::unavailable(time, &wanted)
        } else {
            let mut reading = Reading::new(time);
            for (measurement, s) in &series {
                let value = s.reduce(&self.policy);
                if !value.is_available() {
                    log::warn!(
                        target: self.log.target(),
                        "{} has no samples left after warm-up",
                        measurement
                    );
                }
                reading.set(*measurement, value);
            }
            reading
        };

        log::debug!(
            target: self.log.target(),
            "window closed after {} ticks: {:?}",
            ticks,
            sample_counts
        );

        Window {
            reading,
            sample_counts,
            errors,
            ticks,
        }
    }

    fn log_failures(&self, errors: &[SensorError]) {
        let mut per_measurement: BTreeMap<String, usize> = BTreeMap::new();
        for error in errors {
            let key = match error {
                SensorError::Unavailable { measurement }
                | SensorError::NonFinite { measurement, .. }
                | SensorError::KindMismatch { measurement } => measurement.to_string(),
                SensorError::Io { sensor, .. } => sensor.clone(),
            };
            *per_measurement.entry(key).or_default() += 1;
        }
        for (source, failures) in per_measurement {
            log::warn!(
                target: self.log.target(),
                "{}: {} failed reads this window",
                source,
                failures
            );
        }
    }
}
