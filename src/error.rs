//! Error taxonomy for the alerting pipeline.
//!
//! Transport failures are fatal at startup and logged-and-continued at
//! publish time. Store failures are contained inside the handler of the
//! message that hit them. Unknown sensor types are dropped at the edge.

use thiserror::Error;

// ---

/// Failure talking to the message broker.
#[derive(Debug, Error)]
pub enum TransportError {
    // ---
    #[error("broker connection failed after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("declare of queue '{queue}' failed: {reason}")]
    Declare { queue: String, reason: String },

    #[error("publish to queue '{queue}' failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("subscribe to queue '{queue}' failed: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("acknowledgement of delivery {delivery} on '{queue}' failed: {reason}")]
    Ack {
        queue: String,
        delivery: i64,
        reason: String,
    },

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("broker is shut down")]
    Closed,
}

/// Failure of the alert or property store.
#[derive(Debug, Error)]
pub enum StoreError {
    // ---
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored document is malformed: {0}")]
    Document(#[from] serde_json::Error),

    #[error("stored value is invalid: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A sensor type string that names none of the known sensors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sensor type '{0}'")]
pub struct UnknownSensorType(pub String);
