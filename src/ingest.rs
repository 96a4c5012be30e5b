//! Producer side of the pipeline: fan one reading out to both consumers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    error::TransportError,
    messages::{queues, Contract, SensorReadingEvent, SensorType, SensorUpdateEvent},
    transport::EventBus,
};

// ---

#[derive(Clone)]
pub struct SensorReadingPublisher {
    bus: EventBus,
}

impl SensorReadingPublisher {
    // ---
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Publish a reading to the alert queue and the projection queue.
    ///
    /// Both publishes are always attempted; a failure on one queue does not
    /// keep the reading from the other. Each failure is logged with its
    /// queue and the first one is returned.
    pub async fn publish_reading(
        &self,
        property_id: &str,
        plot_id: &str,
        sensor_type: SensorType,
        value: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<SensorReadingEvent, TransportError> {
        // ---
        let reading = SensorReadingEvent {
            id: Uuid::new_v4().to_string(),
            property_id: property_id.to_string(),
            plot_id: plot_id.to_string(),
            sensor_type: sensor_type.to_string(),
            value,
            unit: sensor_type.unit().to_string(),
            timestamp,
        };
        let update = SensorUpdateEvent {
            property_id: reading.property_id.clone(),
            plot_id: reading.plot_id.clone(),
            sensor_type: reading.sensor_type.clone(),
            value,
            timestamp,
        };

        let to_alerts = self.publish_logged(queues::ALERT_SENSOR, &reading).await;
        let to_projection = self
            .publish_logged(queues::PROPERTY_SENSOR_UPDATE, &update)
            .await;
        to_alerts.and(to_projection)?;

        debug!(reading_id = %reading.id, %sensor_type, "reading published");
        Ok(reading)
    }

    async fn publish_logged<M: Contract>(
        &self,
        queue: &str,
        message: &M,
    ) -> Result<(), TransportError> {
        // ---
        let result = self.bus.publish(queue, message).await;
        if let Err(e) = &result {
            error!(queue, error = %e, "failed to publish reading");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        messages::decode,
        transport::{Broker, Delivery, MemoryBroker},
    };
    use async_trait::async_trait;
    use std::{sync::Arc, time::Duration};

    /// Memory broker whose sends to one queue fail.
    struct QueueDown {
        inner: MemoryBroker,
        down: &'static str,
    }

    #[async_trait]
    impl Broker for QueueDown {
        async fn declare(&self, queue: &str) -> Result<(), TransportError> {
            self.inner.declare(queue).await
        }

        async fn send(&self, queue: &str, body: Vec<u8>) -> Result<(), TransportError> {
            // ---
            if queue == self.down {
                return Err(TransportError::Publish {
                    queue: queue.to_string(),
                    reason: "queue unavailable".to_string(),
                });
            }
            self.inner.send(queue, body).await
        }

        async fn receive(
            &self,
            queue: &str,
            wait: Duration,
        ) -> Result<Option<Delivery>, TransportError> {
            self.inner.receive(queue, wait).await
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
            self.inner.ack(delivery).await
        }

        async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
            self.inner.nack(delivery, requeue).await
        }
    }

    fn publisher_with_queue_down(down: &'static str) -> (Arc<QueueDown>, SensorReadingPublisher) {
        // ---
        let broker = Arc::new(QueueDown {
            inner: MemoryBroker::new(),
            down,
        });
        let bus = EventBus::new(broker.clone(), Duration::from_millis(10));
        (broker, SensorReadingPublisher::new(bus))
    }

    async fn humidity(
        publisher: &SensorReadingPublisher,
        value: i64,
    ) -> Result<SensorReadingEvent, TransportError> {
        let value = Decimal::from(value);
        publisher
            .publish_reading("propA", "plotX", SensorType::Humidity, value, Utc::now())
            .await
    }

    #[tokio::test]
    async fn test_reading_reaches_both_queues() {
        // ---
        let broker = Arc::new(MemoryBroker::new());
        let publisher =
            SensorReadingPublisher::new(EventBus::new(broker.clone(), Duration::from_millis(10)));

        let at = Utc::now();
        let reading = tokio_test::assert_ok!(
            publisher
                .publish_reading("propA", "plotX", SensorType::Rainfall, Decimal::from(75), at)
                .await
        );
        assert_eq!(reading.unit, "mm");
        assert_eq!(reading.sensor_type, "Rainfall");

        let alert_bodies = broker.ready_bodies(queues::ALERT_SENSOR);
        let update_bodies = broker.ready_bodies(queues::PROPERTY_SENSOR_UPDATE);
        assert_eq!(alert_bodies.len(), 1);
        assert_eq!(update_bodies.len(), 1);

        let sent: SensorReadingEvent = decode(&alert_bodies[0]).unwrap();
        assert_eq!(sent.id, reading.id);
        let update: SensorUpdateEvent = decode(&update_bodies[0]).unwrap();
        assert_eq!(update.value, Decimal::from(75));
        assert_eq!(update.plot_id, "plotX");
    }

    #[tokio::test]
    async fn test_alert_queue_down_still_updates_projection() {
        // ---
        let (broker, publisher) = publisher_with_queue_down(queues::ALERT_SENSOR);

        let err = tokio_test::assert_err!(humidity(&publisher, 15).await);
        assert!(matches!(
            err,
            TransportError::Publish { ref queue, .. } if queue == queues::ALERT_SENSOR
        ));

        assert!(broker.inner.ready_bodies(queues::ALERT_SENSOR).is_empty());
        let update_bodies = broker.inner.ready_bodies(queues::PROPERTY_SENSOR_UPDATE);
        assert_eq!(update_bodies.len(), 1);
        let update: SensorUpdateEvent = decode(&update_bodies[0]).unwrap();
        assert_eq!(update.value, Decimal::from(15));
    }

    #[tokio::test]
    async fn test_projection_queue_down_still_reaches_alerts() {
        // ---
        let (broker, publisher) = publisher_with_queue_down(queues::PROPERTY_SENSOR_UPDATE);

        tokio_test::assert_err!(humidity(&publisher, 15).await);
        assert_eq!(broker.inner.ready_bodies(queues::ALERT_SENSOR).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_broker_reports_error() {
        // ---
        let broker = Arc::new(MemoryBroker::new());
        broker.close();
        let publisher =
            SensorReadingPublisher::new(EventBus::new(broker.clone(), Duration::from_millis(10)));

        tokio_test::assert_err!(humidity(&publisher, 10).await);
        assert!(broker.ready_bodies(queues::ALERT_SENSOR).is_empty());
    }
}
