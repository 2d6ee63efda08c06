//! Common test utilities for aggregation tests
//!
//! - `TestRng`: deterministic xorshift generator for reproducible noise
//! - `ScriptedSensor`: replays a fixed per-tick script of samples
//! - `NoisySensor`: constant signal plus bounded uniform noise

#![allow(dead_code)]

use async_trait::async_trait;
use edgerelay_core::{Measurement, Sample, Sensor, SensorReadout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Xorshift generator, same sequence for the same seed
pub struct TestRng {
    state: u32,
}

impl TestRng {
    pub fn new(seed: u32) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 17;
        self.state ^= self.state << 5;
        self.state
    }

    pub fn next_f64(&mut self) -> f64 {
        (self.next_u32() >> 8) as f64 / 16_777_216.0
    }

    pub fn gen_range(&mut self, min: f64, max: f64) -> f64 {
        min + self.next_f64() * (max - min)
    }
}

/// Replays `script[tick]` for each measurement; repeats the last entry when exhausted
pub struct ScriptedSensor {
    name: String,
    script: HashMap<Measurement, Vec<Option<Sample>>>,
    tick: usize,
    reads: Arc<AtomicUsize>,
}

impl ScriptedSensor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: HashMap::new(),
            tick: 0,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn numeric(mut self, measurement: Measurement, values: &[f64]) -> Self {
        self.script.insert(
            measurement,
            values.iter().map(|&v| Some(Sample::Numeric(v))).collect(),
        );
        self
    }

    pub fn script(mut self, measurement: Measurement, samples: Vec<Option<Sample>>) -> Self {
        self.script.insert(measurement, samples);
        self
    }

    /// Shared counter of `read` calls
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

#[async_trait]
impl Sensor for ScriptedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self) -> SensorReadout {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let tick = self.tick;
        self.tick += 1;
        self.script
            .iter()
            .map(|(m, samples)| {
                let sample = samples.get(tick).or_else(|| samples.last()).cloned().flatten();
                (*m, sample)
            })
            .collect()
    }
}

/// `base ± amplitude` uniform noise on one measurement
pub struct NoisySensor {
    measurement: Measurement,
    base: f64,
    amplitude: f64,
    rng: TestRng,
}

impl NoisySensor {
    pub fn new(measurement: Measurement, base: f64, amplitude: f64, seed: u32) -> Self {
        Self {
            measurement,
            base,
            amplitude,
            rng: TestRng::new(seed),
        }
    }
}

#[async_trait]
impl Sensor for NoisySensor {
    fn name(&self) -> &str {
        "noisy"
    }

    async fn read(&mut self) -> SensorReadout {
        let value = self.base + self.rng.gen_range(-self.amplitude, self.amplitude);
        HashMap::from([(self.measurement, Some(Sample::Numeric(value)))])
    }
}
