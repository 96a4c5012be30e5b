//! Sensor readings in, alert status changes out.
//!
//! Per (property, plot, sensor type):
//!
//! | active alert | rule triggers | action                         |
//! |--------------|---------------|--------------------------------|
//! | no           | yes           | create record, emit active     |
//! | yes          | yes           | nothing                        |
//! | yes          | no            | deactivate record, emit cleared|
//! | no           | no            | nothing                        |
//!
//! Re-evaluating the same reading against the same stored state is a
//! no-op, which is what makes redelivery harmless.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use super::{AlertRecord, AlertStore};
use crate::{
    error::StoreError,
    messages::{queues, AlertStatusEvent, SensorReadingEvent, SensorType},
    rules,
    transport::{EventBus, Handler},
};

// ---

/// Status text carried by the event that clears an alert.
pub const NORMALIZED_MESSAGE: &str = "normalized";

/// What one reading did to the alert state of its key.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Normal to alerting: this record was created.
    Raised(AlertRecord),
    /// Already alerting and still triggering.
    Holding(AlertRecord),
    /// Alerting to normal: this record was deactivated.
    Normalized(AlertRecord),
    /// Normal and still normal.
    Quiet,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub raised: u64,
    pub normalized: u64,
}

pub struct AlertConsumer {
    // ---
    store: Arc<dyn AlertStore>,
    bus: EventBus,
    raised: AtomicU64,
    normalized: AtomicU64,
}

impl AlertConsumer {
    // ---
    pub fn new(store: Arc<dyn AlertStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            raised: AtomicU64::new(0),
            normalized: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            raised: self.raised.load(Ordering::Relaxed),
            normalized: self.normalized.load(Ordering::Relaxed),
        }
    }

    /// Subscribe to the alert sensor queue.
    pub async fn start(self: &Arc<Self>) -> Result<(), crate::error::TransportError> {
        // ---
        info!(queue = queues::ALERT_SENSOR, "alert consumer starting");
        self.bus
            .subscribe::<SensorReadingEvent, _>(queues::ALERT_SENSOR, Arc::clone(self))
            .await
    }

    /// Compare the triggered rules with the stored active alert and apply
    /// the resulting transition to the store.
    pub async fn reconcile(
        &self,
        sensor_type: SensorType,
        reading: &SensorReadingEvent,
    ) -> Result<Transition, StoreError> {
        // ---
        let active = self
            .store
            .get_active_alert(&reading.property_id, &reading.plot_id, sensor_type)
            .await?;
        let effective = rules::effective_rule(sensor_type, reading.value);

        let transition = match (active, effective) {
            (None, Some(rule)) => {
                let alert =
                    AlertRecord::raise(rule, &reading.property_id, &reading.plot_id, reading.value);
                self.store.create_alert(&alert).await?;
                Transition::Raised(alert)
            }
            (Some(alert), Some(_)) => Transition::Holding(alert),
            (Some(mut alert), None) => {
                self.store.deactivate_alert(alert.id).await?;
                alert.is_active = false;
                Transition::Normalized(alert)
            }
            (None, None) => Transition::Quiet,
        };

        Ok(transition)
    }

    /// Full handling of one reading. Never fails: every problem is logged
    /// and the reading is considered consumed.
    pub async fn process(&self, reading: &SensorReadingEvent) -> Option<Transition> {
        // ---
        let sensor_type = match reading.sensor_type.parse::<SensorType>() {
            Ok(sensor_type) => sensor_type,
            Err(e) => {
                warn!(reading_id = %reading.id, error = %e, "dropping reading");
                return None;
            }
        };

        let transition = match self.reconcile(sensor_type, reading).await {
            Ok(transition) => transition,
            Err(e) => {
                error!(
                    reading_id = %reading.id,
                    property_id = %reading.property_id,
                    plot_id = %reading.plot_id,
                    %sensor_type,
                    error = %e,
                    "failed to reconcile alert state"
                );
                return None;
            }
        };

        match &transition {
            Transition::Raised(alert) => {
                self.raised.fetch_add(1, Ordering::Relaxed);
                warn!(
                    property_id = %alert.property_id,
                    plot_id = %alert.plot_id,
                    %sensor_type,
                    value = %reading.value,
                    threshold = %alert.threshold,
                    "ALERT RAISED: {}",
                    alert.message
                );
                self.notify(alert, &alert.message, true).await;
            }
            Transition::Holding(_) => {
                info!(
                    property_id = %reading.property_id,
                    plot_id = %reading.plot_id,
                    %sensor_type,
                    "alert already active"
                );
            }
            Transition::Normalized(alert) => {
                self.normalized.fetch_add(1, Ordering::Relaxed);
                info!(
                    property_id = %alert.property_id,
                    plot_id = %alert.plot_id,
                    %sensor_type,
                    value = %reading.value,
                    "ALERT CLEARED: value normalized"
                );
                self.notify(alert, NORMALIZED_MESSAGE, false).await;
            }
            Transition::Quiet => {}
        }

        Some(transition)
    }

    async fn notify(&self, alert: &AlertRecord, message: &str, is_active: bool) {
        // ---
        let event = AlertStatusEvent {
            property_id: alert.property_id.clone(),
            plot_id: alert.plot_id.clone(),
            alert_type: alert.alert_type.to_string(),
            message: message.to_string(),
            is_active,
        };

        match self.bus.publish(queues::PROPERTY_ALERT_STATUS, &event).await {
            Ok(()) => info!(alert_type = %alert.alert_type, is_active, "alert status published"),
            Err(e) => error!(
                alert_type = %alert.alert_type,
                is_active,
                error = %e,
                "failed to publish alert status"
            ),
        }
    }
}

#[async_trait]
impl Handler<SensorReadingEvent> for AlertConsumer {
    async fn handle(&self, message: SensorReadingEvent) -> anyhow::Result<()> {
        // ---
        info!(
            property_id = %message.property_id,
            plot_id = %message.plot_id,
            sensor_type = %message.sensor_type,
            value = %message.value,
            "sensor reading received"
        );
        self.process(&message).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        alerts::MemoryAlertStore,
        messages::decode,
        rules::AlertType,
        transport::MemoryBroker,
    };
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::time::Duration;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        store: Arc<MemoryAlertStore>,
        consumer: AlertConsumer,
    }

    fn fixture() -> Fixture {
        // ---
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryAlertStore::new());
        let bus = EventBus::new(broker.clone(), Duration::from_millis(10));
        let consumer = AlertConsumer::new(store.clone(), bus);
        Fixture {
            broker,
            store,
            consumer,
        }
    }

    impl Fixture {
        fn emitted(&self) -> Vec<AlertStatusEvent> {
            self.broker
                .ready_bodies(queues::PROPERTY_ALERT_STATUS)
                .iter()
                .map(|b| decode(b).unwrap())
                .collect()
        }
    }

    fn reading(sensor_type: &str, value: i64) -> SensorReadingEvent {
        SensorReadingEvent {
            id: "r1".to_string(),
            property_id: "propA".to_string(),
            plot_id: "plotX".to_string(),
            sensor_type: sensor_type.to_string(),
            value: Decimal::from(value),
            unit: "%".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_triggering_value_raises_one_alert() {
        // ---
        let f = fixture();
        let transition = f.consumer.process(&reading("Humidity", 10)).await.unwrap();

        let Transition::Raised(alert) = transition else {
            panic!("expected a raised alert, got {transition:?}");
        };
        assert_eq!(alert.alert_type, AlertType::DroughtAlert);
        assert_eq!(alert.threshold, Decimal::from(20));
        assert_eq!(f.store.create_calls(), 1);

        let emitted = f.emitted();
        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].is_active);
        assert_eq!(emitted[0].message, "Critical drought alert");
        assert_eq!(emitted[0].alert_type, "DroughtAlert");
        assert_eq!(f.consumer.stats().raised, 1);
    }

    #[tokio::test]
    async fn test_still_triggering_value_is_silent() {
        // ---
        let f = fixture();
        f.consumer.process(&reading("Humidity", 10)).await;
        let second = f.consumer.process(&reading("Humidity", 25)).await.unwrap();

        assert!(matches!(second, Transition::Holding(_)));
        assert_eq!(f.store.create_calls(), 1);
        assert_eq!(f.store.deactivate_calls(), 0);
        assert_eq!(f.emitted().len(), 1);
    }

    #[tokio::test]
    async fn test_normal_value_clears_alert_once() {
        // ---
        let f = fixture();
        f.consumer.process(&reading("Humidity", 10)).await;
        let cleared = f.consumer.process(&reading("Humidity", 50)).await.unwrap();
        let again = f.consumer.process(&reading("Humidity", 50)).await.unwrap();

        assert!(matches!(cleared, Transition::Normalized(ref a) if !a.is_active));
        assert_eq!(again, Transition::Quiet);
        assert_eq!(f.store.deactivate_calls(), 1);

        let emitted = f.emitted();
        assert_eq!(emitted.len(), 2);
        assert!(!emitted[1].is_active);
        assert_eq!(emitted[1].message, NORMALIZED_MESSAGE);
        assert_eq!(f.consumer.stats(), AlertStats { raised: 1, normalized: 1 });
    }

    #[tokio::test]
    async fn test_normal_value_without_alert_is_noop() {
        // ---
        let f = fixture();
        let transition = f.consumer.process(&reading("Temperature", 20)).await.unwrap();

        assert_eq!(transition, Transition::Quiet);
        assert_eq!(f.store.create_calls(), 0);
        assert!(f.emitted().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_sensor_type_is_dropped() {
        // ---
        let f = fixture();
        assert!(f.consumer.process(&reading("Wind", 999)).await.is_none());
        assert!(f.store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_sensor_type_is_case_insensitive() {
        // ---
        let f = fixture();
        let transition = f.consumer.process(&reading("rainfall", 120)).await.unwrap();
        assert!(matches!(
            transition,
            Transition::Raised(ref a) if a.sensor_type == SensorType::Rainfall
        ));
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        // ---
        let f = fixture();
        f.store.set_unavailable(true);

        let result = f.consumer.handle(reading("Humidity", 10)).await;
        assert!(result.is_ok());
        assert!(f.emitted().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_alert() {
        // ---
        let f = fixture();
        f.broker.close();

        let result = f.consumer.handle(reading("Humidity", 10)).await;
        assert!(result.is_ok());
        assert_eq!(f.store.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_alerts_are_tracked_per_sensor_type() {
        // ---
        let f = fixture();
        f.consumer.process(&reading("Humidity", 10)).await;
        let temp = f.consumer.process(&reading("Temperature", 45)).await.unwrap();

        assert!(matches!(temp, Transition::Raised(_)));
        assert_eq!(f.store.create_calls(), 2);
    }
}
