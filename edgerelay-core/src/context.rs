//! Explicit logging context handed to every pipeline component
//!
//! Components never pick a log target on their own. The agent builds one
//! [`LogContext`] for its device identity at startup and derives a scoped child
//! for each component, so every line from the pipeline can be filtered by device
//! and component (`RUST_LOG=edgerelay::device7::publisher=debug`).

use std::fmt;
use std::sync::Arc;

/// Root prefix for every target produced by a context
pub const TARGET_ROOT: &str = "edgerelay";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContext {
    device: Arc<str>,
    target: Arc<str>,
}

impl LogContext {
    /// Context for a device identity
    pub fn new(device: &str) -> Self {
        Self {
            device: Arc::from(device),
            target: Arc::from(format!("{TARGET_ROOT}::{device}").as_str()),
        }
    }

    /// Child context for one component
    pub fn scoped(&self, component: &str) -> Self {
        Self {
            device: Arc::clone(&self.device),
            target: Arc::from(format!("{}::{component}", self.target).as_str()),
        }
    }

    /// Log target, for use as `log::info!(target: ctx.target(), ...)`
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.target)
    }
}
