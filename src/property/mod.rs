//! Read-side property aggregate and the projection that keeps it current.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::messages::SensorType;

mod projection;
mod store;

pub use projection::{ProjectionConsumer, ProjectionOutcome};
pub use store::{MemoryPropertyStore, PgPropertyStore, PropertyStore};

// ---

/// Status text of a crop with no active alert.
pub const NORMAL_STATUS: &str = "Normal";

/// A farm property with its plots. Persisted as one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmProperty {
    // ---
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    /// Soft-delete flag; inactive properties are invisible to lookups.
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub plots: Vec<Plot>,
}

fn default_active() -> bool {
    true
}

impl FarmProperty {
    pub fn plot_mut(&mut self, plot_id: &str) -> Option<&mut Plot> {
        self.plots.iter_mut().find(|p| p.id == plot_id)
    }

    pub fn plot(&self, plot_id: &str) -> Option<&Plot> {
        self.plots.iter().find(|p| p.id == plot_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plot {
    // ---
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub area: Decimal,
    #[serde(default)]
    pub latitude: Decimal,
    #[serde(default)]
    pub longitude: Decimal,
    #[serde(default)]
    pub crop: Crop,
}

/// What is growing on a plot and its latest sensor picture. Owned by the
/// plot; has no identity of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crop {
    // ---
    pub name: String,
    pub status: String,
    pub current_humidity: Decimal,
    pub current_temperature: Decimal,
    pub current_rainfall: Decimal,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for Crop {
    fn default() -> Self {
        Self {
            name: String::new(),
            status: NORMAL_STATUS.to_string(),
            current_humidity: Decimal::ZERO,
            current_temperature: Decimal::ZERO,
            current_rainfall: Decimal::ZERO,
            last_updated: None,
        }
    }
}

impl Crop {
    /// Record the latest value of one sensor.
    pub fn apply_reading(&mut self, sensor_type: SensorType, value: Decimal, at: DateTime<Utc>) {
        // ---
        match sensor_type {
            SensorType::Humidity => self.current_humidity = value,
            SensorType::Temperature => self.current_temperature = value,
            SensorType::Rainfall => self.current_rainfall = value,
        }
        self.last_updated = Some(at);
    }

    /// Active alerts show their message; a cleared alert resets to normal.
    pub fn apply_status(&mut self, is_active: bool, message: &str) {
        self.status = if is_active {
            message.to_string()
        } else {
            NORMAL_STATUS.to_string()
        };
    }
}
