//! Alert lifecycle: the record, its store, and the consumer that keeps at
//! most one active alert per (property, plot, sensor type).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    messages::SensorType,
    rules::{AlertType, Rule},
};

mod consumer;
mod store;

pub use consumer::{AlertConsumer, AlertStats, Transition, NORMALIZED_MESSAGE};
pub use store::{AlertStore, MemoryAlertStore, PgAlertStore};

// ---

/// A raised alert. `is_active` flips to false once the reading normalizes;
/// records are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    // ---
    pub id: Uuid,
    pub property_id: String,
    pub plot_id: String,
    pub alert_type: AlertType,
    pub message: String,
    pub sensor_type: SensorType,
    pub sensor_value: Decimal,
    pub threshold: Decimal,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

impl AlertRecord {
    /// New active alert for the reading `value` that triggered `rule`.
    pub fn raise(rule: &Rule, property_id: &str, plot_id: &str, value: Decimal) -> Self {
        // ---
        Self {
            id: Uuid::new_v4(),
            property_id: property_id.to_string(),
            plot_id: plot_id.to_string(),
            alert_type: rule.alert_type,
            message: rule.message.to_string(),
            sensor_type: rule.sensor_type,
            sensor_value: value,
            threshold: rule.threshold(),
            created_at: Utc::now(),
            is_active: true,
        }
    }
}
