//! Network reachability probing
//!
//! The orchestrator asks before every delivery whether the network is usable at
//! all. The answer only has to be cheap and roughly right: a `true` that turns
//! out wrong costs one failed send, which the orchestrator absorbs by
//! buffering. The probe opens a TCP connection to a well-known address and
//! closes it immediately.

use async_trait::async_trait;
use edgerelay_core::LogContext;
use log::debug;
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;

/// Answers whether the network currently looks usable
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probe target settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    /// `host:port` to connect to
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_address() -> String {
    "8.8.8.8:53".to_string()
}

fn default_timeout() -> u64 {
    3000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            timeout_ms: default_timeout(),
        }
    }
}

/// TCP connect probe with a bounded timeout
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
    log: LogContext,
}

impl TcpProbe {
    pub fn new(config: &ProbeConfig, log: LogContext) -> Self {
        Self {
            address: config.address.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            log,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Reachability for TcpProbe {
    async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.address.as_str())).await {
            Ok(Ok(_)) => true,
            Ok(Err(error)) => {
                debug!(target: self.log.target(), "{} unreachable: {error}", self.address);
                false
            }
            Err(_) => {
                debug!(
                    target: self.log.target(),
                    "{} did not answer within {:?}",
                    self.address,
                    self.timeout
                );
                false
            }
        }
    }
}
