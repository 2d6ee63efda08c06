//! Shared fakes for delivery tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use edgerelay_connectors::{ConnectionStats, Publisher, Reachability};
use edgerelay_core::{BatchSplitter, LogContext, Measurement, Reading, Value};
use edgerelay_store::LocalBuffer;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const COLUMNS: [Measurement; 2] = [Measurement::Temperature, Measurement::Direction];

pub fn log() -> LogContext {
    LogContext::new("test-device")
}

/// Reading number `n`, distinguishable by time and temperature
pub fn reading(n: i64) -> Reading {
    Reading::new(Utc.timestamp_opt(1_700_000_000 + n * 300, 0).unwrap())
        .with(Measurement::Temperature, Value::Numeric(20.0 + n as f64))
        .with(Measurement::Direction, Value::Label("NE".to_string()))
}

pub fn buffer() -> LocalBuffer {
    LocalBuffer::open_in_memory("test-device", &COLUMNS, log().scoped("buffer")).unwrap()
}

pub fn splitter(ceiling: usize) -> BatchSplitter {
    BatchSplitter::new(ceiling, log().scoped("splitter"))
}

/// Publisher that records every batch and answers from a script
///
/// Once the script runs out it keeps answering `default`.
#[derive(Clone)]
pub struct RecordingPublisher {
    sent: Arc<Mutex<Vec<Vec<Reading>>>>,
    script: Arc<Mutex<VecDeque<bool>>>,
    default: bool,
}

impl RecordingPublisher {
    pub fn accepting() -> Self {
        Self::scripted(&[], true)
    }

    pub fn rejecting() -> Self {
        Self::scripted(&[], false)
    }

    pub fn scripted(answers: &[bool], default: bool) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(answers.iter().copied().collect())),
            default,
        }
    }

    /// Batches passed to `send`, accepted or not
    pub fn batches(&self) -> Vec<Vec<Reading>> {
        self.sent.lock().unwrap().clone()
    }

    /// Readings from accepted and rejected batches, flattened in order
    pub fn flattened(&self) -> Vec<Reading> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn set_default(&mut self, default: bool) {
        self.default = default;
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn send(&mut self, batch: &[Reading]) -> bool {
        self.sent.lock().unwrap().push(batch.to_vec());
        self.script.lock().unwrap().pop_front().unwrap_or(self.default)
    }

    fn is_connected(&self) -> bool {
        self.default
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.sent.lock().unwrap().len() as u64,
            ..ConnectionStats::default()
        }
    }
}

/// Reachability answer controlled from the test
#[derive(Clone)]
pub struct Switch(Arc<AtomicBool>);

impl Switch {
    pub fn new(up: bool) -> Self {
        Self(Arc::new(AtomicBool::new(up)))
    }

    pub fn set(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl Reachability for Switch {
    async fn is_reachable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
