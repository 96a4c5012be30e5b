//! In-process broker with the same delivery contract as the Postgres one.
//!
//! Used by tests and by single-process runs that do not need durability
//! across restarts.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};

use super::{Broker, Delivery};
use crate::error::TransportError;

// ---

#[derive(Debug, Clone)]
struct Pending {
    tag: i64,
    body: Vec<u8>,
    delivery_count: i32,
}

#[derive(Debug, Default)]
struct MemQueue {
    ready: VecDeque<Pending>,
    unacked: HashMap<i64, Pending>,
    sent: usize,
}

impl MemQueue {
    /// Remove the unacked entry `delivery` refers to, unless it has been
    /// delivered again since.
    fn take_unacked(&mut self, delivery: &Delivery) -> Option<Pending> {
        // ---
        let current = self.unacked.get(&delivery.tag)?.delivery_count;
        if current != delivery.delivery_count {
            return None;
        }
        self.unacked.remove(&delivery.tag)
    }
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    // ---
    queues: std::sync::Mutex<HashMap<String, MemQueue>>,
    notify: Notify,
    next_tag: AtomicI64,
    closed: AtomicBool,
}

impl MemoryBroker {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse all further operations, as a dropped connection would.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Messages waiting to be delivered on `queue`.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len())
    }

    /// Messages delivered on `queue` but not yet settled.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len())
    }

    /// Messages ever accepted on `queue`.
    pub fn sent_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.sent)
    }

    /// Bodies waiting on `queue`, in delivery order.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.ready.iter().map(|p| p.body.clone()).collect())
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&MemQueue) -> T) -> T {
        // ---
        match self.queues.lock() {
            Ok(queues) => queues.get(queue).map(f).unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().get(queue).map(f).unwrap_or_default(),
        }
    }

    fn with_queues_mut<T>(&self, f: impl FnOnce(&mut HashMap<String, MemQueue>) -> T) -> T {
        // ---
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut queues)
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn try_claim(&self, queue: &str) -> Option<Delivery> {
        // ---
        self.with_queues_mut(|queues| {
            let q = queues.get_mut(queue)?;
            let mut pending = q.ready.pop_front()?;
            pending.delivery_count += 1;
            let delivery = Delivery {
                queue: queue.to_string(),
                tag: pending.tag,
                body: pending.body.clone(),
                delivery_count: pending.delivery_count,
            };
            q.unacked.insert(pending.tag, pending);
            Some(delivery)
        })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    // ---
    async fn declare(&self, queue: &str) -> Result<(), TransportError> {
        self.check_open()?;
        self.with_queues_mut(|queues| {
            queues.entry(queue.to_string()).or_default();
        });
        Ok(())
    }

    async fn send(&self, queue: &str, body: Vec<u8>) -> Result<(), TransportError> {
        // ---
        self.check_open()?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.with_queues_mut(|queues| {
            let q = queues.entry(queue.to_string()).or_default();
            q.sent += 1;
            q.ready.push_back(Pending {
                tag,
                body,
                delivery_count: 0,
            });
        });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        // ---
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a concurrent send is not missed.
            let notified = self.notify.notified();
            self.check_open()?;

            if let Some(delivery) = self.try_claim(queue) {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        // ---
        self.check_open()?;
        self.with_queues_mut(|queues| {
            if let Some(q) = queues.get_mut(&delivery.queue) {
                q.take_unacked(delivery);
            }
        });
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        // ---
        self.check_open()?;
        self.with_queues_mut(|queues| {
            let Some(q) = queues.get_mut(&delivery.queue) else {
                return;
            };
            if let Some(pending) = q.take_unacked(delivery) {
                if requeue {
                    q.ready.push_front(pending);
                }
            }
        });
        if requeue {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const QUEUE: &str = "q";

    #[tokio::test]
    async fn test_receive_times_out_on_empty_queue() {
        // ---
        let broker = MemoryBroker::new();
        broker.declare(QUEUE).await.unwrap();
        let got = broker.receive(QUEUE, Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_requeued_message_keeps_its_position() {
        // ---
        let broker = MemoryBroker::new();
        broker.send(QUEUE, b"first".to_vec()).await.unwrap();
        broker.send(QUEUE, b"second".to_vec()).await.unwrap();

        let first = broker.receive(QUEUE, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        assert!(!first.redelivered());
        broker.nack(&first, true).await.unwrap();

        let again = broker.receive(QUEUE, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.body, b"first".to_vec());
        assert_eq!(again.tag, first.tag);
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn test_ack_and_drop_remove_message() {
        // ---
        let broker = MemoryBroker::new();
        broker.send(QUEUE, b"a".to_vec()).await.unwrap();
        broker.send(QUEUE, b"b".to_vec()).await.unwrap();

        let a = broker.receive(QUEUE, Duration::ZERO).await.unwrap().unwrap();
        let b = broker.receive(QUEUE, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(broker.unacked_len(QUEUE), 2);

        broker.ack(&a).await.unwrap();
        broker.nack(&b, false).await.unwrap();
        assert_eq!(broker.unacked_len(QUEUE), 0);
        assert_eq!(broker.ready_len(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_stale_delivery_cannot_settle_redelivered_message() {
        // ---
        let broker = MemoryBroker::new();
        broker.send(QUEUE, b"a".to_vec()).await.unwrap();

        let stale = broker.receive(QUEUE, Duration::ZERO).await.unwrap().unwrap();
        broker.nack(&stale, true).await.unwrap();
        let current = broker.receive(QUEUE, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(current.delivery_count, 2);

        // The first holder settling late leaves the second delivery alone.
        broker.nack(&stale, true).await.unwrap();
        broker.ack(&stale).await.unwrap();
        assert_eq!(broker.unacked_len(QUEUE), 1);
        assert_eq!(broker.ready_len(QUEUE), 0);

        broker.ack(&current).await.unwrap();
        assert_eq!(broker.unacked_len(QUEUE), 0);
        assert_eq!(broker.sent_count(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_waiting_receiver_wakes_on_send() {
        // ---
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive(QUEUE, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.send(QUEUE, b"late".to_vec()).await.unwrap();

        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.body, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_operations() {
        // ---
        let broker = MemoryBroker::new();
        broker.close();
        assert!(matches!(
            broker.send(QUEUE, b"x".to_vec()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            broker.receive(QUEUE, Duration::ZERO).await,
            Err(TransportError::Closed)
        ));
    }
}
