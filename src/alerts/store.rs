//! Alert persistence, keyed by (property, plot, sensor type, active flag).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::AlertRecord;
use crate::{error::StoreError, messages::SensorType, rules::AlertType};

// ---

#[async_trait]
pub trait AlertStore: Send + Sync + 'static {
    // ---
    async fn create_alert(&self, record: &AlertRecord) -> Result<(), StoreError>;

    /// The active alert for the key. Should more than one exist, the most
    /// recently created wins.
    async fn get_active_alert(
        &self,
        property_id: &str,
        plot_id: &str,
        sensor_type: SensorType,
    ) -> Result<Option<AlertRecord>, StoreError>;

    async fn deactivate_alert(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Row shape of the `alerts` table.
#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    // ---
    id: Uuid,
    property_id: String,
    plot_id: String,
    alert_type: String,
    message: String,
    sensor_type: String,
    sensor_value: Decimal,
    threshold: Decimal,
    created_at: DateTime<Utc>,
    is_active: bool,
}

impl TryFrom<AlertRow> for AlertRecord {
    type Error = StoreError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        // ---
        let alert_type = AlertType::parse(&row.alert_type)
            .ok_or_else(|| StoreError::Corrupt(format!("alert type '{}'", row.alert_type)))?;
        let sensor_type = row
            .sensor_type
            .parse::<SensorType>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(AlertRecord {
            id: row.id,
            property_id: row.property_id,
            plot_id: row.plot_id,
            alert_type,
            message: row.message,
            sensor_type,
            sensor_value: row.sensor_value,
            threshold: row.threshold,
            created_at: row.created_at,
            is_active: row.is_active,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertStore for PgAlertStore {
    // ---
    async fn create_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, property_id, plot_id, alert_type, message,
                sensor_type, sensor_value, threshold, created_at, is_active
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(&record.property_id)
        .bind(&record.plot_id)
        .bind(record.alert_type.as_str())
        .bind(&record.message)
        .bind(record.sensor_type.as_str())
        .bind(record.sensor_value)
        .bind(record.threshold)
        .bind(record.created_at)
        .bind(record.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_active_alert(
        &self,
        property_id: &str,
        plot_id: &str,
        sensor_type: SensorType,
    ) -> Result<Option<AlertRecord>, StoreError> {
        // ---
        let row: Option<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, property_id, plot_id, alert_type, message,
                   sensor_type, sensor_value, threshold, created_at, is_active
            FROM alerts
            WHERE property_id = $1
              AND plot_id     = $2
              AND sensor_type = $3
              AND is_active
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(property_id)
        .bind(plot_id)
        .bind(sensor_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(AlertRecord::try_from).transpose()
    }

    async fn deactivate_alert(&self, id: Uuid) -> Result<(), StoreError> {
        // ---
        sqlx::query("UPDATE alerts SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory store with call counters, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    // ---
    records: Mutex<Vec<AlertRecord>>,
    creates: AtomicUsize,
    deactivations: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryAlertStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deactivate_calls(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }

    pub async fn records(&self) -> Vec<AlertRecord> {
        self.records.lock().await.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("alert store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    // ---
    async fn create_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
        self.check()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn get_active_alert(
        &self,
        property_id: &str,
        plot_id: &str,
        sensor_type: SensorType,
    ) -> Result<Option<AlertRecord>, StoreError> {
        // ---
        self.check()?;
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| {
                r.is_active
                    && r.property_id == property_id
                    && r.plot_id == plot_id
                    && r.sensor_type == sensor_type
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn deactivate_alert(&self, id: Uuid) -> Result<(), StoreError> {
        // ---
        self.check()?;
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().await;
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            record.is_active = false;
        }
        Ok(())
    }
}
