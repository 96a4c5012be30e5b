//! Durable publish/subscribe over a message broker.
//!
//! Gateway module (EMBP): siblings hold the broker implementations and the
//! typed bus; callers only see what is re-exported here.
//!
//! Delivery is at-least-once. Each subscription runs on its own worker with
//! one unacknowledged message at a time (prefetch = 1). Handler success
//! acknowledges; handler failure negatively acknowledges with requeue.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

mod bus;
mod memory;
mod postgres;

pub use bus::{EventBus, Handler};
pub use memory::MemoryBroker;
pub use postgres::{connect_with_retry, PgBroker, RetryPolicy};

// ---

/// A message handed to a subscriber and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    // ---
    pub queue: String,
    /// Broker-assigned identifier used for ack/nack.
    pub tag: i64,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: i32,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Raw broker operations. Serialization and worker management live in
/// [`EventBus`]; implementations only move bytes between named queues.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    // ---
    /// Declare a durable queue; a no-op if it already exists.
    async fn declare(&self, queue: &str) -> Result<(), TransportError>;

    /// Persist `body` on `queue`. Returns once the broker holds the message.
    async fn send(&self, queue: &str, body: Vec<u8>) -> Result<(), TransportError>;

    /// Claim the next message of `queue`, waiting at most `wait`.
    async fn receive(&self, queue: &str, wait: Duration)
        -> Result<Option<Delivery>, TransportError>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Reject a delivered message, putting it back at its original position
    /// when `requeue` is set and discarding it otherwise.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;
}
