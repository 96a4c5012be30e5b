//! Durable queues stored in Postgres.
//!
//! Each message is a row of `queue_messages`. A subscriber claims the oldest
//! visible row with `FOR UPDATE SKIP LOCKED` and leases it for the
//! visibility window; ack deletes the row, requeue ends the lease early.
//! A worker that dies mid-message simply lets the lease lapse, and the row
//! is delivered again.
//!
//! Handlers run without a timeout, so the visibility window must exceed the
//! slowest expected handler. A holder whose lease lapsed can no longer
//! settle the row: ack and nack match on the delivery count it was handed.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, info, warn};

use super::{Broker, Delivery};
use crate::error::TransportError;

// ---

// Settlement only touches the row while it is still under this delivery.
const DELETE_HELD: &str = "DELETE FROM queue_messages WHERE id = $1 AND delivery_count = $2";
const REQUEUE_HELD: &str =
    "UPDATE queue_messages SET available_at = NOW() WHERE id = $1 AND delivery_count = $2";

/// Fixed-backoff retry applied to the startup connection.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

/// Open the connection pool, retrying per `policy`.
///
/// Exhausting the attempts is fatal for the caller: nothing in this service
/// can run without the broker.
pub async fn connect_with_retry(
    url: &str,
    pool_max: u32,
    policy: RetryPolicy,
) -> Result<PgPool, TransportError> {
    // ---
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match PgPoolOptions::new()
            .max_connections(pool_max)
            .connect(url)
            .await
        {
            Ok(pool) => {
                info!(attempt, "connected to broker database");
                return Ok(pool);
            }
            Err(e) if attempt < attempts => {
                warn!(attempt, attempts, error = %e, "broker connection attempt failed");
                tokio::time::sleep(policy.delay).await;
            }
            Err(source) => return Err(TransportError::Connect { attempts, source }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
    visibility: Duration,
}

impl PgBroker {
    // ---
    pub fn new(pool: PgPool, visibility: Duration) -> Self {
        Self { pool, visibility }
    }

    /// Settling matched no row: the lease lapsed and the message was handed
    /// out again, or it is already gone.
    fn log_lost_lease(delivery: &Delivery, rows_affected: u64) {
        if rows_affected == 0 {
            warn!(
                queue = %delivery.queue,
                tag = delivery.tag,
                delivery_count = delivery.delivery_count,
                "delivery no longer held, settlement skipped"
            );
        }
    }

    fn ack_error(delivery: &Delivery, e: sqlx::Error) -> TransportError {
        TransportError::Ack {
            queue: delivery.queue.clone(),
            delivery: delivery.tag,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Broker for PgBroker {
    // ---
    async fn declare(&self, queue: &str) -> Result<(), TransportError> {
        // ---
        sqlx::query("INSERT INTO queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| TransportError::Declare {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn send(&self, queue: &str, body: Vec<u8>) -> Result<(), TransportError> {
        // ---
        let body = String::from_utf8(body).map_err(|e| TransportError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO queue_messages (queue, body, persistent)
            VALUES ($1, $2::JSONB, TRUE)
            "#,
        )
        .bind(queue)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| TransportError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        // ---
        let claimed: Option<(i64, String, i32)> = sqlx::query_as(
            r#"
            WITH picked AS (
                SELECT id
                FROM queue_messages
                WHERE queue = $1 AND available_at <= NOW()
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_messages m
            SET available_at   = NOW() + make_interval(secs => $2),
                delivery_count = m.delivery_count + 1
            FROM picked
            WHERE m.id = picked.id
            RETURNING m.id, m.body::TEXT, m.delivery_count
            "#,
        )
        .bind(queue)
        .bind(self.visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TransportError::Subscribe {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

        match claimed {
            Some((tag, body, delivery_count)) => Ok(Some(Delivery {
                queue: queue.to_string(),
                tag,
                body: body.into_bytes(),
                delivery_count,
            })),
            None => {
                // Nothing visible; idle for the poll interval.
                debug!(queue, "queue empty");
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        // ---
        let result = sqlx::query(DELETE_HELD)
            .bind(delivery.tag)
            .bind(delivery.delivery_count)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::ack_error(delivery, e))?;

        Self::log_lost_lease(delivery, result.rows_affected());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        // ---
        let query = if requeue { REQUEUE_HELD } else { DELETE_HELD };

        let result = sqlx::query(query)
            .bind(delivery.tag)
            .bind(delivery.delivery_count)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::ack_error(delivery, e))?;

        Self::log_lost_lease(delivery, result.rows_affected());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_default_retry_policy() {
        // ---
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(3));
    }

    #[test]
    fn test_settlement_is_scoped_to_current_delivery() {
        // ---
        for query in [DELETE_HELD, REQUEUE_HELD] {
            assert!(query.contains("WHERE id = $1 AND delivery_count = $2"), "{query}");
        }
    }
}
