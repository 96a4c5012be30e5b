//! Applies sensor updates and alert status changes to the property
//! aggregate.
//!
//! Both subscriptions do a read-modify-replace of the whole document. Inside
//! one process the two paths are serialized per property id, so a sensor
//! update and a status change for the same property never overwrite each
//! other. Two projection processes sharing a store can still race; the
//! later replace wins.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use super::{Plot, PropertyStore};
use crate::{
    error::{StoreError, TransportError},
    messages::{queues, AlertStatusEvent, SensorType, SensorUpdateEvent},
    transport::{EventBus, Handler},
};

// ---

/// Result of applying one event to the aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionOutcome {
    Applied,
    MissingProperty,
    MissingPlot,
    UnknownSensorType,
}

/// One async mutex per property id.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    // ---
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        // ---
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody is holding or waiting on.
            locks.retain(|k, l| k == key || Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct ProjectionConsumer {
    store: Arc<dyn PropertyStore>,
    locks: KeyedLocks,
}

impl ProjectionConsumer {
    // ---
    pub fn new(store: Arc<dyn PropertyStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::default(),
        }
    }

    /// Subscribe to the sensor update and alert status queues.
    pub async fn start(self: &Arc<Self>, bus: &EventBus) -> Result<(), TransportError> {
        // ---
        info!("projection consumer starting");
        bus.subscribe::<SensorUpdateEvent, _>(queues::PROPERTY_SENSOR_UPDATE, Arc::clone(self))
            .await?;
        bus.subscribe::<AlertStatusEvent, _>(queues::PROPERTY_ALERT_STATUS, Arc::clone(self))
            .await
    }

    /// Set the current value of the reported sensor on the plot.
    pub async fn apply_sensor_update(
        &self,
        update: &SensorUpdateEvent,
    ) -> Result<ProjectionOutcome, StoreError> {
        // ---
        let Ok(sensor_type) = update.sensor_type.parse::<SensorType>() else {
            return Ok(ProjectionOutcome::UnknownSensorType);
        };

        self.modify_plot(&update.property_id, &update.plot_id, |plot| {
            plot.crop
                .apply_reading(sensor_type, update.value, update.timestamp);
        })
        .await
    }

    /// Set the plot status from an alert status change.
    pub async fn apply_alert_status(
        &self,
        status: &AlertStatusEvent,
    ) -> Result<ProjectionOutcome, StoreError> {
        // ---
        self.modify_plot(&status.property_id, &status.plot_id, |plot| {
            plot.crop.apply_status(status.is_active, &status.message);
        })
        .await
    }

    async fn modify_plot(
        &self,
        property_id: &str,
        plot_id: &str,
        apply: impl FnOnce(&mut Plot) + Send,
    ) -> Result<ProjectionOutcome, StoreError> {
        // ---
        let _guard = self.locks.acquire(property_id).await;

        let Some(mut property) = self.store.get_by_id(property_id).await? else {
            return Ok(ProjectionOutcome::MissingProperty);
        };
        let Some(plot) = property.plot_mut(plot_id) else {
            return Ok(ProjectionOutcome::MissingPlot);
        };

        apply(plot);
        self.store.replace(&property).await?;
        Ok(ProjectionOutcome::Applied)
    }

    fn log_outcome(
        &self,
        kind: &str,
        property_id: &str,
        plot_id: &str,
        result: Result<ProjectionOutcome, StoreError>,
    ) {
        // ---
        match result {
            Ok(ProjectionOutcome::Applied) => {
                info!(property_id, plot_id, "plot {kind} applied")
            }
            Ok(ProjectionOutcome::MissingProperty) => {
                warn!(property_id, "property not found, {kind} dropped")
            }
            Ok(ProjectionOutcome::MissingPlot) => {
                warn!(property_id, plot_id, "plot not found, {kind} dropped")
            }
            Ok(ProjectionOutcome::UnknownSensorType) => {
                warn!(property_id, plot_id, "unknown sensor type, {kind} dropped")
            }
            Err(e) => error!(property_id, plot_id, error = %e, "failed to apply {kind}"),
        }
    }
}

#[async_trait]
impl Handler<SensorUpdateEvent> for ProjectionConsumer {
    async fn handle(&self, message: SensorUpdateEvent) -> anyhow::Result<()> {
        // ---
        info!(
            property_id = %message.property_id,
            plot_id = %message.plot_id,
            sensor_type = %message.sensor_type,
            value = %message.value,
            "sensor update received"
        );
        let result = self.apply_sensor_update(&message).await;
        self.log_outcome("sensor update", &message.property_id, &message.plot_id, result);
        Ok(())
    }
}

#[async_trait]
impl Handler<AlertStatusEvent> for ProjectionConsumer {
    async fn handle(&self, message: AlertStatusEvent) -> anyhow::Result<()> {
        // ---
        info!(
            property_id = %message.property_id,
            plot_id = %message.plot_id,
            alert_type = %message.alert_type,
            is_active = message.is_active,
            "alert status received"
        );
        let result = self.apply_alert_status(&message).await;
        self.log_outcome("alert status", &message.property_id, &message.plot_id, result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::property::{Crop, FarmProperty, MemoryPropertyStore, NORMAL_STATUS};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn farm() -> FarmProperty {
        // ---
        FarmProperty {
            id: "propA".to_string(),
            name: "Fazenda Boa Vista".to_string(),
            address: String::new(),
            owner_id: "owner-1".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            active: true,
            plots: vec![
                Plot {
                    id: "plotX".to_string(),
                    name: "North".to_string(),
                    area: Decimal::from(12),
                    latitude: Decimal::ZERO,
                    longitude: Decimal::ZERO,
                    crop: Crop {
                        name: "Soy".to_string(),
                        current_humidity: Decimal::from(45),
                        current_temperature: Decimal::from(24),
                        current_rainfall: Decimal::from(2),
                        ..Default::default()
                    },
                },
                Plot {
                    id: "plotY".to_string(),
                    name: "South".to_string(),
                    area: Decimal::from(8),
                    latitude: Decimal::ZERO,
                    longitude: Decimal::ZERO,
                    crop: Crop::default(),
                },
            ],
        }
    }

    async fn projection_with_farm() -> (Arc<MemoryPropertyStore>, ProjectionConsumer) {
        let store = Arc::new(MemoryPropertyStore::new());
        store.insert(farm()).await;
        (store.clone(), ProjectionConsumer::new(store))
    }

    fn update(sensor_type: &str, value: i64) -> SensorUpdateEvent {
        SensorUpdateEvent {
            property_id: "propA".to_string(),
            plot_id: "plotX".to_string(),
            sensor_type: sensor_type.to_string(),
            value: Decimal::from(value),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    fn status(is_active: bool, message: &str) -> AlertStatusEvent {
        AlertStatusEvent {
            property_id: "propA".to_string(),
            plot_id: "plotX".to_string(),
            alert_type: "DroughtAlert".to_string(),
            message: message.to_string(),
            is_active,
        }
    }

    #[tokio::test]
    async fn test_sensor_update_sets_only_matching_field() {
        // ---
        let (store, projection) = projection_with_farm().await;
        let before = store.snapshot("propA").await.unwrap();

        let outcome = projection.apply_sensor_update(&update("humidity", 18)).await.unwrap();
        assert_eq!(outcome, ProjectionOutcome::Applied);

        let after = store.snapshot("propA").await.unwrap();
        let crop = &after.plot("plotX").unwrap().crop;
        assert_eq!(crop.current_humidity, Decimal::from(18));
        assert_eq!(crop.last_updated, Some(update("humidity", 18).timestamp));

        let mut expected = before.clone();
        let expected_crop = &mut expected.plot_mut("plotX").unwrap().crop;
        expected_crop.current_humidity = Decimal::from(18);
        expected_crop.last_updated = crop.last_updated;
        assert_eq!(after, expected);
    }

    #[tokio::test]
    async fn test_alert_status_sets_and_resets_status() {
        // ---
        let (store, projection) = projection_with_farm().await;

        projection.apply_alert_status(&status(true, "Drought alert")).await.unwrap();
        let crop = store.snapshot("propA").await.unwrap().plot("plotX").unwrap().crop.clone();
        assert_eq!(crop.status, "Drought alert");

        projection.apply_alert_status(&status(false, "normalized")).await.unwrap();
        let crop = store.snapshot("propA").await.unwrap().plot("plotX").unwrap().crop.clone();
        assert_eq!(crop.status, NORMAL_STATUS);
    }

    #[tokio::test]
    async fn test_missing_property_or_plot_is_dropped() {
        // ---
        let (store, projection) = projection_with_farm().await;

        let mut missing_property = update("Rainfall", 60);
        missing_property.property_id = "ghost".to_string();
        let mut missing_plot = status(true, "Heavy rain");
        missing_plot.plot_id = "plotZ".to_string();

        assert_eq!(
            projection.apply_sensor_update(&missing_property).await.unwrap(),
            ProjectionOutcome::MissingProperty
        );
        assert_eq!(
            projection.apply_alert_status(&missing_plot).await.unwrap(),
            ProjectionOutcome::MissingPlot
        );
        assert_eq!(store.replace_calls(), 0);
    }

    #[tokio::test]
    async fn test_inactive_property_is_not_projected() {
        // ---
        let (store, projection) = projection_with_farm().await;
        let mut deleted = farm();
        deleted.active = false;
        store.insert(deleted).await;

        let outcome = projection.apply_sensor_update(&update("Humidity", 10)).await.unwrap();
        assert_eq!(outcome, ProjectionOutcome::MissingProperty);
    }

    #[tokio::test]
    async fn test_unknown_sensor_type_is_dropped() {
        // ---
        let (store, projection) = projection_with_farm().await;
        let outcome = projection.apply_sensor_update(&update("wind", 10)).await.unwrap();
        assert_eq!(outcome, ProjectionOutcome::UnknownSensorType);
        assert_eq!(store.replace_calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed_by_handler() {
        // ---
        let (store, projection) = projection_with_farm().await;
        store.set_unavailable(true);

        let result =
            Handler::<SensorUpdateEvent>::handle(&projection, update("Humidity", 10)).await;
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_paths_keep_both_writes() {
        // ---
        let (store, projection) = projection_with_farm().await;
        let projection = Arc::new(projection);
        store.set_read_delay(Duration::from_millis(50));

        // Both reads would see the original document without the lock.
        let sensor = {
            let p = Arc::clone(&projection);
            tokio::spawn(async move { p.apply_sensor_update(&update("Temperature", 38)).await })
        };
        let alert = {
            let p = Arc::clone(&projection);
            let raised = status(true, "High temperature");
            tokio::spawn(async move { p.apply_alert_status(&raised).await })
        };

        assert_eq!(sensor.await.unwrap().unwrap(), ProjectionOutcome::Applied);
        assert_eq!(alert.await.unwrap().unwrap(), ProjectionOutcome::Applied);

        let crop = store.snapshot("propA").await.unwrap().plot("plotX").unwrap().crop.clone();
        assert_eq!(crop.current_temperature, Decimal::from(38));
        assert_eq!(crop.status, "High temperature");
        assert_eq!(crop.current_humidity, Decimal::from(45));
        assert_eq!(store.replace_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_paths_do_not_lose_updates() {
        // ---
        let (store, projection) = projection_with_farm().await;
        let projection = Arc::new(projection);
        store.set_read_delay(Duration::from_millis(5));

        let mut tasks = Vec::new();
        for i in 0..10 {
            let p = Arc::clone(&projection);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    p.apply_sensor_update(&update("Temperature", 30 + i)).await
                } else {
                    p.apply_alert_status(&status(true, "High temperature")).await
                }
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), ProjectionOutcome::Applied);
        }

        let crop = store.snapshot("propA").await.unwrap().plot("plotX").unwrap().crop.clone();
        assert_eq!(crop.status, "High temperature");
        assert!(crop.current_temperature >= Decimal::from(30));
        assert_eq!(store.replace_calls(), 10);
    }
}
