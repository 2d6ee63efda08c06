//! EdgeRelay agent
//!
//! Wires the pipeline together for one device identity:
//!
//! ```text
//! SensorTable ─▶ SamplingAggregator ─▶ DeliveryOrchestrator ─┬─▶ MqttPublisher
//!                                                            └─▶ LocalBuffer
//! ```
//!
//! The `edgerelay` binary drives this from a TOML config; the pieces are public
//! so other binaries can embed the agent with their own sensors.

#![deny(unsafe_code)]

pub mod config;
pub mod logging;
pub mod orchestrator;
pub mod sensors;

pub use config::{AgentConfig, ConfigError, SensorConfig};
pub use orchestrator::{DeliveryOrchestrator, DeliveryState};
pub use sensors::{build_table, SimulatedSensor, SysfsSensor};
