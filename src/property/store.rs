//! Property aggregate persistence: whole-document reads and replaces.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use sqlx::{types::Json, PgPool};
use tokio::sync::Mutex;

use super::FarmProperty;
use crate::error::StoreError;

// ---

#[async_trait]
pub trait PropertyStore: Send + Sync + 'static {
    // ---
    /// The active property with this id, if any.
    async fn get_by_id(&self, property_id: &str) -> Result<Option<FarmProperty>, StoreError>;

    /// Overwrite the stored document with `property`.
    async fn replace(&self, property: &FarmProperty) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgPropertyStore {
    pool: PgPool,
}

impl PgPropertyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PropertyStore for PgPropertyStore {
    // ---
    async fn get_by_id(&self, property_id: &str) -> Result<Option<FarmProperty>, StoreError> {
        // ---
        let document: Option<(Json<FarmProperty>,)> =
            sqlx::query_as("SELECT document FROM properties WHERE id = $1 AND active")
                .bind(property_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(document.map(|(Json(property),)| property))
    }

    async fn replace(&self, property: &FarmProperty) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            UPDATE properties
            SET document   = $2,
                owner_id   = $3,
                active     = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&property.id)
        .bind(Json(property))
        .bind(&property.owner_id)
        .bind(property.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-memory store with a replace counter, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    // ---
    documents: Mutex<HashMap<String, FarmProperty>>,
    replaces: AtomicUsize,
    unavailable: AtomicBool,
    read_delay_ms: AtomicU64,
}

impl MemoryPropertyStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, property: FarmProperty) {
        self.documents
            .lock()
            .await
            .insert(property.id.clone(), property);
    }

    /// The stored document regardless of its active flag.
    pub async fn snapshot(&self, property_id: &str) -> Option<FarmProperty> {
        self.documents.lock().await.get(property_id).cloned()
    }

    pub fn replace_calls(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Pause every lookup after it has read the document, widening the
    /// window between a read and the replace that follows it.
    pub fn set_read_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.read_delay_ms.store(ms, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("property store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PropertyStore for MemoryPropertyStore {
    // ---
    async fn get_by_id(&self, property_id: &str) -> Result<Option<FarmProperty>, StoreError> {
        self.check()?;
        let found = {
            let documents = self.documents.lock().await;
            documents.get(property_id).filter(|p| p.active).cloned()
        };

        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(found)
    }

    async fn replace(&self, property: &FarmProperty) -> Result<(), StoreError> {
        // ---
        self.check()?;
        self.replaces.fetch_add(1, Ordering::SeqCst);
        let mut documents = self.documents.lock().await;
        if let Some(stored) = documents.get_mut(&property.id) {
            *stored = property.clone();
        }
        Ok(())
    }
}
