//! Typed event bus on top of a [`Broker`].
//!
//! One worker task per subscription. A worker claims a single delivery,
//! runs the handler to completion, settles the delivery, and only then asks
//! for the next one. Shutdown is a `watch` signal checked between
//! deliveries, so an in-flight handler always finishes.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{Broker, Delivery};
use crate::{
    error::TransportError,
    messages::{self, Contract},
};

// ---

/// Processes one decoded message. Returning an error requeues the delivery.
#[async_trait]
pub trait Handler<M: Contract>: Send + Sync + 'static {
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

/// Cloneable handle to the bus and its subscription workers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    broker: Arc<dyn Broker>,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
    declared: Mutex<HashSet<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    live: Arc<AtomicUsize>,
}

impl EventBus {
    // ---
    pub fn new(broker: Arc<dyn Broker>, poll_interval: Duration) -> Self {
        // ---
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                broker,
                poll_interval,
                shutdown,
                declared: Mutex::new(HashSet::new()),
                workers: Mutex::new(Vec::new()),
                live: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Serialize `message` and deliver it, persistent, to `queue`.
    ///
    /// The queue is declared on first use. Returns once the broker has
    /// accepted the message, not once anyone has consumed it.
    pub async fn publish<M: Contract>(
        &self,
        queue: &str,
        message: &M,
    ) -> Result<(), TransportError> {
        // ---
        self.ensure_declared(queue).await?;
        let body = messages::encode(message)?;
        self.inner.broker.send(queue, body).await?;
        debug!(queue, "message published");
        Ok(())
    }

    /// Start a worker that feeds every message of `queue` to `handler`.
    pub async fn subscribe<M, H>(&self, queue: &str, handler: Arc<H>) -> Result<(), TransportError>
    where
        M: Contract,
        H: Handler<M>,
    {
        // ---
        self.ensure_declared(queue)
            .await
            .map_err(|e| TransportError::Subscribe {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let worker = Worker {
            broker: Arc::clone(&self.inner.broker),
            queue: queue.to_string(),
            poll_interval: self.inner.poll_interval,
            shutdown: self.inner.shutdown.subscribe(),
            live: Arc::clone(&self.inner.live),
        };

        let handle = tokio::spawn(worker.run::<M, H>(handler));
        self.inner.workers.lock().await.push(handle);

        info!(queue, "subscribed");
        Ok(())
    }

    /// Signal every worker to stop after its current delivery.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Number of subscription workers currently running.
    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Wait for every worker to exit. Call after [`EventBus::shutdown`].
    pub async fn join(&self) {
        // ---
        let handles = std::mem::take(&mut *self.inner.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "subscription worker terminated abnormally");
            }
        }
    }

    async fn ensure_declared(&self, queue: &str) -> Result<(), TransportError> {
        // ---
        let mut declared = self.inner.declared.lock().await;
        if !declared.contains(queue) {
            self.inner.broker.declare(queue).await?;
            declared.insert(queue.to_string());
        }
        Ok(())
    }
}

struct Worker {
    // ---
    broker: Arc<dyn Broker>,
    queue: String,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
}

/// Keeps the live-worker count honest even if a handler panics.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        LiveGuard(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Worker {
    // ---
    async fn run<M, H>(mut self, handler: Arc<H>)
    where
        M: Contract,
        H: Handler<M>,
    {
        // ---
        let _live = LiveGuard::enter(&self.live);
        info!(queue = %self.queue, "subscription worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = self.shutdown.changed() => break,
                received = self.broker.receive(&self.queue, self.poll_interval) => received,
            };

            match received {
                Ok(Some(delivery)) => self.dispatch::<M, H>(handler.as_ref(), delivery).await,
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "receive failed");
                    tokio::select! {
                        _ = self.shutdown.changed() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!(queue = %self.queue, "subscription worker stopped");
    }

    async fn dispatch<M, H>(&self, handler: &H, delivery: Delivery)
    where
        M: Contract,
        H: Handler<M>,
    {
        // ---
        debug!(
            queue = %delivery.queue,
            tag = delivery.tag,
            delivery_count = delivery.delivery_count,
            redelivered = delivery.redelivered(),
            "message delivered"
        );

        let message = match messages::decode::<M>(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                // A body that cannot be decoded now never will be.
                warn!(
                    queue = %delivery.queue,
                    tag = delivery.tag,
                    error = %e,
                    "undecodable message dropped"
                );
                self.settle(&delivery, Settle::Drop).await;
                return;
            }
        };

        match handler.handle(message).await {
            Ok(()) => self.settle(&delivery, Settle::Ack).await,
            Err(e) => {
                error!(
                    queue = %delivery.queue,
                    tag = delivery.tag,
                    error = %e,
                    "handler failed, requeueing"
                );
                self.settle(&delivery, Settle::Requeue).await;
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, settle: Settle) {
        // ---
        let result = match settle {
            Settle::Ack => self.broker.ack(delivery).await,
            Settle::Requeue => self.broker.nack(delivery, true).await,
            Settle::Drop => self.broker.nack(delivery, false).await,
        };

        // Unsettled deliveries come back once their lease expires.
        if let Err(e) = result {
            error!(
                queue = %delivery.queue,
                tag = delivery.tag,
                error = %e,
                "failed to settle delivery"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    Drop,
}
