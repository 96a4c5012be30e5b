use std::sync::Arc;

use axum::Router;

use crate::{alerts::AlertConsumer, config::WorkerRole, transport::EventBus};

mod health;

// ---

/// Shared state of the probe endpoints.
#[derive(Clone)]
pub struct AppState {
    // ---
    pub bus: EventBus,
    pub role: WorkerRole,
    pub alerts: Option<Arc<AlertConsumer>>,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new().merge(health::router()).with_state(state)
}
