//! MQTT publisher for EdgeRelay
//!
//! ## Connection Model
//!
//! `rumqttc` splits a connection into an [`AsyncClient`] (request handle) and an
//! [`EventLoop`] that must be polled for anything to happen. The event loop runs
//! on its own task for the lifetime of the publisher. It reconnects on its own
//! after every failure and reports the link state through a `watch` channel.
//!
//! ```text
//! Disconnected ──poll──▶ Connecting ──ConnAck(Success)──▶ Connected
//!       ▲                                                    │
//!       └──────────────── error / broker Disconnect ─────────┘
//! ```
//!
//! `send` never blocks forever. If the link is down it waits at most
//! `reconnect_timeout_secs` for the event loop to bring it back, then gives up
//! and reports `false`.
//!
//! ## TLS
//!
//! With a `[broker.tls]` section the publisher connects with mutual TLS using
//! the CA bundle, device certificate and private key read from disk at
//! construction. Without one it falls back to plain TCP, which is only meant
//! for local brokers during development.

use crate::{encode_payload, ConnectionStats, ConnectorError, Envelope, Publisher};
use async_trait::async_trait;
use edgerelay_core::splitter::encoded_len;
use edgerelay_core::{LogContext, Reading, DEFAULT_BATCH_CEILING};
use log::{debug, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Request channel depth between the client handle and the event loop
const REQUEST_CAPACITY: usize = 16;

/// Headroom above the batch ceiling for the envelope and MQTT framing
const PACKET_HEADROOM: usize = 64 * 1024;

/// Largest remaining length an MQTT packet can declare
pub const MQTT_MAX_PACKET: usize = 268_435_455;

/// Topic length prefix plus packet identifier of a QoS 1 PUBLISH
const PUBLISH_FIXED_FIELDS: usize = 4;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// MQTT client identifier; the device name when unset
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Upper bound on how long `send` waits for a lost link to return
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout_secs: u64,
    /// Delay between reconnection attempts
    #[serde(default = "default_reconnect_poll")]
    pub reconnect_poll_ms: u64,
    #[serde(default = "default_max_packet")]
    pub max_packet_bytes: usize,
    #[serde(default)]
    pub tls: Option<TlsFiles>,
}

/// Paths to the PEM files used for mutual TLS
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

fn default_port() -> u16 {
    8883
}

fn default_topic() -> String {
    "telemetry/readings".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_timeout() -> u64 {
    15
}

fn default_reconnect_poll() -> u64 {
    1000
}

fn default_max_packet() -> usize {
    DEFAULT_BATCH_CEILING.saturating_add(PACKET_HEADROOM).min(MQTT_MAX_PACKET)
}

impl MqttConfig {
    /// Create new configuration for a broker host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            topic: default_topic(),
            client_id: None,
            keep_alive_secs: default_keep_alive(),
            reconnect_timeout_secs: default_reconnect_timeout(),
            reconnect_poll_ms: default_reconnect_poll(),
            max_packet_bytes: default_max_packet(),
            tls: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn keep_alive_secs(mut self, secs: u64) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn reconnect_timeout_secs(mut self, secs: u64) -> Self {
        self.reconnect_timeout_secs = secs;
        self
    }

    pub fn reconnect_poll_ms(mut self, millis: u64) -> Self {
        self.reconnect_poll_ms = millis;
        self
    }

    /// Size packets for a given batch ceiling, never above the MQTT limit
    pub fn batch_ceiling(mut self, ceiling: usize) -> Self {
        self.max_packet_bytes = ceiling.saturating_add(PACKET_HEADROOM).min(MQTT_MAX_PACKET);
        self
    }

    /// Largest data array that still fits one PUBLISH for `device` on this topic
    ///
    /// The envelope around the array and the topic both count against the
    /// MQTT remaining length limit.
    pub fn max_batch_ceiling(&self, device: &str) -> usize {
        // `data` encodes as `[]` here; the array's own brackets are part of the ceiling
        let envelope = encoded_len(&Envelope { device, data: &[] }).saturating_sub(2);
        MQTT_MAX_PACKET
            .saturating_sub(PUBLISH_FIXED_FIELDS)
            .saturating_sub(self.topic.len())
            .saturating_sub(envelope)
    }

    /// Enable mutual TLS
    pub fn tls_files(
        mut self,
        ca_cert: impl Into<PathBuf>,
        client_cert: impl Into<PathBuf>,
        client_key: impl Into<PathBuf>,
    ) -> Self {
        self.tls = Some(TlsFiles {
            ca_cert: ca_cert.into(),
            client_cert: client_cert.into(),
            client_key: client_key.into(),
        });
        self
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub fn reconnect_poll(&self) -> Duration {
        Duration::from_millis(self.reconnect_poll_ms)
    }

    fn options(&self, device: &str) -> Result<MqttOptions, ConnectorError> {
        let client_id = self.client_id.as_deref().unwrap_or(device);
        let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
        let packet_limit = self.max_packet_bytes.min(MQTT_MAX_PACKET);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(1)))
            .set_clean_session(true)
            .set_max_packet_size(packet_limit, packet_limit);

        if let Some(tls) = &self.tls {
            let ca = read_pem(&tls.ca_cert)?;
            let cert = read_pem(&tls.client_cert)?;
            let key = read_pem(&tls.client_key)?;
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert, key)),
            }));
        }

        Ok(options)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConnectorError> {
    std::fs::read(path).map_err(|source| ConnectorError::Tls {
        path: path.display().to_string(),
        source,
    })
}

/// Broker link as last reported by the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Publishes reading batches over MQTT
pub struct MqttPublisher {
    client: AsyncClient,
    link: watch::Receiver<LinkState>,
    driver: JoinHandle<()>,
    stats: Arc<Mutex<ConnectionStats>>,
    device: String,
    topic: String,
    reconnect_timeout: Duration,
    log: LogContext,
}

impl MqttPublisher {
    /// Start the connection; must be called inside a Tokio runtime
    ///
    /// Only configuration problems (unreadable TLS material) fail here. The
    /// broker itself is contacted in the background.
    pub fn connect(
        config: MqttConfig,
        device: impl Into<String>,
        log: LogContext,
    ) -> Result<Self, ConnectorError> {
        let device = device.into();
        let options = config.options(&device)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (link_tx, link) = watch::channel(LinkState::Disconnected);
        let stats = Arc::new(Mutex::new(ConnectionStats::default()));

        info!(
            target: log.target(),
            "connecting to {}:{} ({})",
            config.host,
            config.port,
            if config.tls.is_some() { "tls" } else { "plain tcp" }
        );

        let driver = tokio::spawn(drive(
            eventloop,
            link_tx,
            Arc::clone(&stats),
            config.reconnect_poll(),
            log.clone(),
        ));

        Ok(Self {
            client,
            link,
            driver,
            stats,
            device,
            topic: config.topic.clone(),
            reconnect_timeout: config.reconnect_timeout(),
            log,
        })
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    /// Send a clean MQTT disconnect and stop the event loop
    pub async fn disconnect(&mut self) {
        if let Err(error) = self.client.disconnect().await {
            debug!(target: self.log.target(), "disconnect request dropped: {error}");
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.driver).await;
        self.driver.abort();
    }

    async fn wait_connected(&mut self) -> Result<(), ConnectorError> {
        if *self.link.borrow() == LinkState::Connected {
            return Ok(());
        }

        debug!(
            target: self.log.target(),
            "broker link down, waiting up to {:?}",
            self.reconnect_timeout
        );
        let link = &mut self.link;
        let wait = async move {
            link.wait_for(|state| *state == LinkState::Connected)
                .await
                .map(|_| ())
        };
        match tokio::time::timeout(self.reconnect_timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectorError::NotConnected),
            Err(_) => Err(ConnectorError::Timeout),
        }
    }

    async fn publish(&mut self, batch: &[Reading]) -> Result<usize, ConnectorError> {
        self.wait_connected().await?;
        let payload = encode_payload(&self.device, batch)?;
        let bytes = payload.len();
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|error| ConnectorError::Client(error.to_string()))?;
        Ok(bytes)
    }

    fn with_stats(&self, update: impl FnOnce(&mut ConnectionStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats);
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn send(&mut self, batch: &[Reading]) -> bool {
        match self.publish(batch).await {
            Ok(bytes) => {
                debug!(
                    target: self.log.target(),
                    "published {} readings ({bytes} bytes) to {}",
                    batch.len(),
                    self.topic
                );
                self.with_stats(|stats| {
                    stats.messages_sent += 1;
                    stats.bytes_sent += bytes as u64;
                });
                true
            }
            Err(error) => {
                warn!(
                    target: self.log.target(),
                    "publish of {} readings failed: {error}",
                    batch.len()
                );
                self.with_stats(|stats| {
                    stats.messages_failed += 1;
                    stats.last_error = Some(error.to_string());
                });
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    fn stats(&self) -> ConnectionStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Poll the event loop until the publisher goes away
async fn drive(
    mut eventloop: EventLoop,
    link: watch::Sender<LinkState>,
    stats: Arc<Mutex<ConnectionStats>>,
    retry: Duration,
    log: LogContext,
) {
    let mut connected_once = false;
    link.send_replace(LinkState::Connecting);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    if connected_once {
                        info!(target: log.target(), "reconnected to broker");
                        stats.lock().unwrap_or_else(PoisonError::into_inner).reconnections += 1;
                    } else {
                        info!(target: log.target(), "connected to broker");
                    }
                    connected_once = true;
                    link.send_replace(LinkState::Connected);
                } else {
                    warn!(target: log.target(), "broker refused connection: {:?}", ack.code);
                    link.send_replace(LinkState::Disconnected);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!(target: log.target(), "broker closed the session");
                link.send_replace(LinkState::Disconnected);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                link.send_replace(LinkState::Disconnected);
                break;
            }
            Ok(_) => {}
            Err(error) => {
                let previous = link.send_replace(LinkState::Disconnected);
                if previous == LinkState::Connected {
                    warn!(target: log.target(), "connection lost: {error}");
                } else {
                    debug!(target: log.target(), "connection attempt failed: {error}");
                }
                stats.lock().unwrap_or_else(PoisonError::into_inner).last_error =
                    Some(error.to_string());

                if link.is_closed() {
                    break;
                }
                tokio::time::sleep(retry).await;
                link.send_replace(LinkState::Connecting);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use edgerelay_core::{Measurement, Value};
    use std::io::Write;

    fn log() -> LogContext {
        LogContext::new("test").scoped("publisher")
    }

    /// A local port with nothing listening on it
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_config_builder() {
        let config = MqttConfig::new("broker.example.com")
            .port(1883)
            .topic("site/readings")
            .client_id("node-1")
            .reconnect_timeout_secs(5)
            .batch_ceiling(1024);

        assert_eq!(config.host, "broker.example.com");
        assert_eq!(config.port, 1883);
        assert_eq!(config.topic, "site/readings");
        assert_eq!(config.client_id.as_deref(), Some("node-1"));
        assert_eq!(config.reconnect_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_packet_bytes, 1024 + PACKET_HEADROOM);
        assert!(config.tls.is_none());
    }

    #[test]
    fn packet_size_never_exceeds_mqtt_limit() {
        assert!(MqttConfig::new("broker").max_packet_bytes <= MQTT_MAX_PACKET);
        let config = MqttConfig::new("broker").batch_ceiling(MQTT_MAX_PACKET);
        assert_eq!(config.max_packet_bytes, MQTT_MAX_PACKET);
        let config = MqttConfig::new("broker").batch_ceiling(usize::MAX);
        assert_eq!(config.max_packet_bytes, MQTT_MAX_PACKET);
    }

    #[test]
    fn max_batch_ceiling_leaves_room_for_envelope_and_topic() {
        let config = MqttConfig::new("broker").topic("site/readings");
        let batch = vec![Reading::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
            .with(Measurement::Temperature, Value::Numeric(21.5))];
        let envelope = encode_payload("node-1", &batch).unwrap().len() - encoded_len(&batch[..]);

        let ceiling = config.max_batch_ceiling("node-1");
        assert_eq!(
            ceiling + envelope + PUBLISH_FIXED_FIELDS + "site/readings".len(),
            MQTT_MAX_PACKET
        );
        assert!(DEFAULT_BATCH_CEILING <= ceiling);

        // a longer device name eats into the ceiling
        assert!(config.max_batch_ceiling("a-much-longer-device-name") < ceiling);
    }

    #[test]
    fn defaults_target_tls_port() {
        let config = MqttConfig::new("broker");
        assert_eq!(config.port, 8883);
        assert_eq!(config.reconnect_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn config_deserializes_with_tls() {
        let config: MqttConfig = toml::from_str(
            r#"
            host = "broker.example.com"
            topic = "t"

            [tls]
            ca_cert = "/etc/edgerelay/ca.pem"
            client_cert = "/etc/edgerelay/device.pem"
            client_key = "/etc/edgerelay/device.key"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 8883);
        let tls = config.tls.unwrap();
        assert_eq!(tls.client_key, PathBuf::from("/etc/edgerelay/device.key"));
    }

    #[tokio::test]
    async fn missing_tls_material_fails_construction() {
        let config = MqttConfig::new("localhost").tls_files(
            "/nonexistent/ca.pem",
            "/nonexistent/device.pem",
            "/nonexistent/device.key",
        );

        let result = MqttPublisher::connect(config, "device7", log());
        assert!(matches!(result, Err(ConnectorError::Tls { .. })));
    }

    #[tokio::test]
    async fn tls_material_is_read_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut paths = Vec::new();
        for name in ["ca.pem", "device.pem", "device.key"] {
            let path = dir.path().join(name);
            std::fs::File::create(&path)
                .unwrap()
                .write_all(b"-----BEGIN TEST-----\n-----END TEST-----\n")
                .unwrap();
            paths.push(path);
        }

        let config = MqttConfig::new("127.0.0.1")
            .port(closed_port())
            .tls_files(&paths[0], &paths[1], &paths[2]);
        let publisher = MqttPublisher::connect(config, "device7", log()).unwrap();
        assert!(!publisher.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_reports_failure() {
        let config = MqttConfig::new("127.0.0.1")
            .port(closed_port())
            .reconnect_timeout_secs(2)
            .reconnect_poll_ms(100);
        let mut publisher = MqttPublisher::connect(config, "device7", log()).unwrap();

        let reading = Reading::new(Utc.timestamp_opt(0, 0).unwrap())
            .with(Measurement::Temperature, Value::Numeric(20.0));
        let started = tokio::time::Instant::now();
        assert!(!publisher.send(&[reading]).await);
        assert!(started.elapsed() >= Duration::from_secs(2));

        let stats = publisher.stats();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.messages_failed, 1);
        assert!(stats.last_error.is_some());
        assert!(!publisher.is_connected());
    }
}
