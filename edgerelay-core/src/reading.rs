//! Readings and the Fixed Measurement Set
//!
//! ## Overview
//!
//! A [`Reading`] is the unit of delivery: one reduced value per configured
//! measurement for a single collection window, stamped with the time the window
//! closed. Readings flow from the aggregator to the delivery orchestrator, into
//! the local buffer when the broker is out of reach, and finally onto the wire.
//!
//! ## Measurement Set
//!
//! Measurement names come from a closed set ([`Measurement`]). Keeping the set
//! closed gives the local buffer a fixed column layout and lets the sensor table
//! be checked once at startup instead of at every tick.
//!
//! Each measurement has a [`MeasurementKind`]:
//! - **Numeric** values are filtered and averaged
//! - **Label** values (wind direction) are reduced to the most frequent label
//!
//! ## Wire Form
//!
//! A reading serializes to a flat JSON object. Unavailable values are `null`:
//!
//! ```json
//! {"time": "2024-03-01T10:15:00Z", "temperature": 21.4, "direction": "NE", "pm2_5": null}
//! ```

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::de::{self, Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How a measurement's samples are reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    /// Floating point series, filtered and averaged
    Numeric,
    /// Textual series, reduced to the most frequent label
    Label,
}

/// Fixed set of measurements the agent knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Measurement {
    /// Air temperature (°C)
    Temperature,
    /// Relative humidity (%)
    Humidity,
    /// Barometric pressure (hPa)
    Pressure,
    /// Particulate matter ≤ 1.0 µm (µg/m³)
    Pm1_0,
    /// Particulate matter ≤ 2.5 µm (µg/m³)
    Pm2_5,
    /// Particulate matter ≤ 10 µm (µg/m³)
    Pm10,
    /// Wind speed (m/s)
    WindSpeed,
    /// Wind direction as a compass label
    Direction,
    /// Rainfall (mm)
    Rainfall,
    /// Illuminance (lux)
    Light,
    /// Sound level (dB)
    Noise,
}

impl Measurement {
    /// Every known measurement, in column order
    pub const ALL: [Measurement; 11] = [
        Measurement::Temperature,
        Measurement::Humidity,
        Measurement::Pressure,
        Measurement::Pm1_0,
        Measurement::Pm2_5,
        Measurement::Pm10,
        Measurement::WindSpeed,
        Measurement::Direction,
        Measurement::Rainfall,
        Measurement::Light,
        Measurement::Noise,
    ];

    /// Stable name used for JSON keys and buffer columns
    pub const fn as_str(self) -> &'static str {
        match self {
            Measurement::Temperature => "temperature",
            Measurement::Humidity => "humidity",
            Measurement::Pressure => "pressure",
            Measurement::Pm1_0 => "pm1_0",
            Measurement::Pm2_5 => "pm2_5",
            Measurement::Pm10 => "pm10",
            Measurement::WindSpeed => "wind_speed",
            Measurement::Direction => "direction",
            Measurement::Rainfall => "rainfall",
            Measurement::Light => "light",
            Measurement::Noise => "noise",
        }
    }

    pub const fn kind(self) -> MeasurementKind {
        match self {
            Measurement::Direction => MeasurementKind::Label,
            _ => MeasurementKind::Numeric,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a name is not part of the measurement set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown measurement: {0}")]
pub struct UnknownMeasurement(pub String);

impl FromStr for Measurement {
    type Err = UnknownMeasurement;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Measurement::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMeasurement(s.to_string()))
    }
}

/// Measurements deserialize from their stable name, also as map keys
impl<'de> Deserialize<'de> for Measurement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(de::Error::custom)
    }
}

/// One raw observation produced by a sensor during a window
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Numeric(f64),
    Label(String),
}

/// Reduced value of one measurement for one window
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Numeric(f64),
    Label(String),
    /// Sensor failed, window too short, or nothing left after warm-up
    Unavailable,
}

impl Value {
    pub fn is_available(&self) -> bool {
        !matches!(self, Value::Unavailable)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Numeric(v) => Some(*v),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Numeric(v) => serializer.serialize_f64(*v),
            Value::Label(label) => serializer.serialize_str(label),
            Value::Unavailable => serializer.serialize_none(),
        }
    }
}

/// Reduced values for one collection window
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    time: DateTime<Utc>,
    values: BTreeMap<Measurement, Value>,
}

impl Reading {
    /// Create an empty reading stamped with `time`
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            values: BTreeMap::new(),
        }
    }

    /// Reading with every measurement marked unavailable
    pub fn unavailable(time: DateTime<Utc>, measurements: &[Measurement]) -> Self {
        let mut reading = Self::new(time);
        for &measurement in measurements {
            reading.set(measurement, Value::Unavailable);
        }
        reading
    }

    /// Builder-style setter
    pub fn with(mut self, measurement: Measurement, value: Value) -> Self {
        self.set(measurement, value);
        self
    }

    pub fn set(&mut self, measurement: Measurement, value: Value) {
        self.values.insert(measurement, value);
    }

    pub fn get(&self, measurement: Measurement) -> Option<&Value> {
        self.values.get(&measurement)
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Iterate over measurement values in column order
    pub fn iter(&self) -> impl Iterator<Item = (Measurement, &Value)> {
        self.values.iter().map(|(m, v)| (*m, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when no measurement carries a value
    pub fn is_degraded(&self) -> bool {
        self.values.values().all(|v| !v.is_available())
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len() + 1))?;
        map.serialize_entry("time", &self.time)?;
        for (measurement, value) in &self.values {
            map.serialize_entry(measurement.as_str(), value)?;
        }
        map.end()
    }
}
