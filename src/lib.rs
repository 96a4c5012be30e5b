//! Alerting pipeline for agricultural sensor plots.
//!
//! Sensor readings arrive on durable queues. The alert consumer evaluates
//! them against threshold rules and keeps one active alert per
//! (property, plot, sensor type); the projection consumer folds readings
//! and alert status changes into the property read model.
//!
//! Module layout follows the Explicit Module Boundary Pattern (EMBP): each
//! directory module is a gateway re-exporting what its siblings provide.

pub mod alerts;
pub mod config;
pub mod error;
pub mod ingest;
pub mod messages;
pub mod property;
pub mod routes;
pub mod rules;
pub mod schema;
pub mod transport;

pub use config::Config;
