//! Edge-to-Cloud Delivery Connectors
//!
//! ## Overview
//!
//! This crate holds the two network-facing collaborators of the delivery
//! orchestrator:
//!
//! - [`Publisher`]: hands a batch of readings to the broker transport
//! - [`Reachability`]: cheap yes/no probe of whether the network is usable
//!
//! Both are traits so the orchestrator can be driven by scripted fakes in tests
//! and by the MQTT and TCP implementations in production.
//!
//! ### MQTT
//!
//! **Why MQTT:**
//! - Persistent connection, no per-message handshake
//! - Mutual TLS on port 8883 with per-device client certificates
//! - QoS 1 gives at-least-once hand-off; the broker side deduplicates
//!
//! ```text
//! ┌──────────────┐  send(batch)  ┌──────────────┐  requests  ┌────────────────┐
//! │ Orchestrator │──────────────▶│ MqttPublisher│───────────▶│ event loop task│──▶ broker
//! └──────────────┘◀──── bool ────└──────────────┘◀── watch ──└────────────────┘
//!                                                 link state
//! ```
//!
//! ## Failure Semantics
//!
//! A publisher never returns an error to the orchestrator. Timeouts, refused
//! connections, DNS failures and serialization problems all become `false`,
//! and the orchestrator answers `false` by buffering. A `true` only means the
//! transport accepted the batch; it says nothing about broker persistence.
//!
//! ## Wire Payload
//!
//! ```json
//! {"device": "device7", "data": [{"time": "...", "temperature": 21.4}, ...]}
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use edgerelay_connectors::{mqtt::{MqttConfig, MqttPublisher}, Publisher};
//! use edgerelay_core::LogContext;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MqttConfig::new("broker.example.com")
//!     .topic("telemetry/readings")
//!     .tls_files("ca.pem", "client.pem", "client.key");
//!
//! let mut publisher = MqttPublisher::connect(config, "device7", LogContext::new("device7"))?;
//! let delivered = publisher.send(&[]).await;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub mod reachability;

// Re-export common types
#[cfg(feature = "mqtt")]
pub use mqtt::{LinkState, MqttConfig, MqttPublisher, MQTT_MAX_PACKET};
pub use reachability::{ProbeConfig, Reachability, TcpProbe};

use async_trait::async_trait;
use edgerelay_core::Reading;
use serde::Serialize;
use thiserror::Error;

/// Common connector errors
///
/// These stay inside the connectors; the [`Publisher`] contract reports `bool`.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Not connected")]
    NotConnected,

    #[error("Timed out waiting for broker connection")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Cannot read TLS material {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Delivers batches of readings to the broker
#[async_trait]
pub trait Publisher: Send {
    /// Publish one batch; `true` when the transport accepted it
    async fn send(&mut self, batch: &[Reading]) -> bool;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;
}

/// Connection statistics common to all publishers
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Batches accepted by the transport
    pub messages_sent: u64,
    /// Batches that failed to send
    pub messages_failed: u64,
    /// Payload bytes accepted by the transport
    pub bytes_sent: u64,
    /// Successful reconnections after the first connection
    pub reconnections: u32,
    /// Last error message
    pub last_error: Option<String>,
}

/// Broker message body: device identity plus the batch
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub device: &'a str,
    pub data: &'a [Reading],
}

/// Serialize a batch into the broker payload
pub fn encode_payload(device: &str, batch: &[Reading]) -> Result<Vec<u8>, ConnectorError> {
    Ok(serde_json::to_vec(&Envelope { device, data: batch })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use edgerelay_core::{Measurement, Value};

    #[test]
    fn payload_wraps_batch_with_device() {
        let reading = Reading::new(Utc.timestamp_opt(0, 0).unwrap())
            .with(Measurement::Temperature, Value::Numeric(21.5))
            .with(Measurement::Pm10, Value::Unavailable);

        let payload = encode_payload("device7", &[reading.clone(), reading]).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(json["device"], "device7");
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["temperature"], 21.5);
        assert!(data[0]["pm10"].is_null());
        assert_eq!(data[0]["time"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn empty_batch_is_an_empty_array() {
        let payload = encode_payload("d", &[]).unwrap();
        assert_eq!(payload, br#"{"device":"d","data":[]}"#);
    }
}
