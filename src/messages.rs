//! Wire contracts shared by the producer and both consumers.
//!
//! Every message travels as a JSON object with camelCase field names. Keys
//! are matched case-insensitively on decode, so `PropertyId`, `propertyId`
//! and `propertyid` all land in the same field.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::UnknownSensorType;

// ---

/// Logical queue names. These are a stable contract between deployments.
pub mod queues {
    /// Sensor readings headed for the alert consumer.
    pub const ALERT_SENSOR: &str = "alert-sensor-queue";
    /// Sensor readings headed for the projection consumer.
    pub const PROPERTY_SENSOR_UPDATE: &str = "property-sensor-update-queue";
    /// Alert status changes headed for the projection consumer.
    pub const PROPERTY_ALERT_STATUS: &str = "property-alert-status-queue";
}

/// The three sensors a plot can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    Humidity,
    Temperature,
    Rainfall,
}

impl SensorType {
    // ---
    pub const ALL: [SensorType; 3] = [
        SensorType::Humidity,
        SensorType::Temperature,
        SensorType::Rainfall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Humidity => "Humidity",
            SensorType::Temperature => "Temperature",
            SensorType::Rainfall => "Rainfall",
        }
    }

    /// Unit attached to readings of this sensor.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Humidity => "%",
            SensorType::Temperature => "C",
            SensorType::Rainfall => "mm",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = UnknownSensorType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        let trimmed = s.trim();
        SensorType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownSensorType(s.to_string()))
    }
}

/// A message type that can travel over the bus.
///
/// `FIELDS` lists the canonical (camelCase) key of every field so that
/// decoding can fold incoming keys onto them regardless of case.
pub trait Contract: Serialize + DeserializeOwned + Send + Sync + 'static {
    const FIELDS: &'static [&'static str];
}

/// One ingested reading, as published to the alert queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReadingEvent {
    // ---
    pub id: String,
    pub property_id: String,
    pub plot_id: String,
    /// Kept as text so an unknown sensor can be logged and dropped by the
    /// consumer instead of failing the decode.
    pub sensor_type: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub value: Decimal,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl Contract for SensorReadingEvent {
    const FIELDS: &'static [&'static str] = &[
        "id",
        "propertyId",
        "plotId",
        "sensorType",
        "value",
        "unit",
        "timestamp",
    ];
}

/// Latest value of one sensor, as published to the projection queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorUpdateEvent {
    // ---
    pub property_id: String,
    pub plot_id: String,
    pub sensor_type: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub value: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Contract for SensorUpdateEvent {
    const FIELDS: &'static [&'static str] =
        &["propertyId", "plotId", "sensorType", "value", "timestamp"];
}

/// Alert raised or cleared for a plot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatusEvent {
    // ---
    pub property_id: String,
    pub plot_id: String,
    pub alert_type: String,
    pub message: String,
    pub is_active: bool,
}

impl Contract for AlertStatusEvent {
    const FIELDS: &'static [&'static str] =
        &["propertyId", "plotId", "alertType", "message", "isActive"];
}

/// Serialize a message to its canonical encoding.
pub fn encode<M: Contract>(message: &M) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Decode a message, matching field names without regard to case.
pub fn decode<M: Contract>(body: &[u8]) -> Result<M, serde_json::Error> {
    // ---
    let value: Value = serde_json::from_slice(body)?;
    let value = match value {
        Value::Object(object) => Value::Object(fold_keys(object, M::FIELDS)),
        other => other,
    };
    serde_json::from_value(value)
}

fn fold_keys(object: Map<String, Value>, fields: &[&str]) -> Map<String, Value> {
    // ---
    object
        .into_iter()
        .map(|(key, value)| {
            let canonical = fields
                .iter()
                .find(|f| f.eq_ignore_ascii_case(&key))
                .map(|f| f.to_string())
                .unwrap_or(key);
            (canonical, value)
        })
        .collect()
}
