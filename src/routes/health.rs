// src/routes/health.rs
//! Liveness and readiness endpoints for the alerting service.
//!
//! Container orchestrators (e.g., Docker, Kubernetes) probe these routes to
//! decide whether the process is alive and whether its queue workers are
//! running. This is a sibling module in the `routes` directory and follows
//! the Explicit Module Boundary Pattern (EMBP):
//! - Internal to this file: endpoint handlers and related types
//! - Exports to the gateway (`mod.rs`): a subrouter with `/health` and `/ready`

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::alerts::AlertStats;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    role: String,
    workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    alerts: Option<AlertStats>,
}

/// JSON response body for the `/ready` endpoint.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    workers: usize,
    expected: usize,
}

/// Handle `GET /health`.
///
/// Always answers while the process is up; reports live worker count and,
/// when this process runs the alert consumer, its raise/clear counters.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    // ---
    Json(HealthResponse {
        status: "ok",
        role: state.role.to_string(),
        workers: state.bus.live_workers(),
        alerts: state.alerts.as_ref().map(|a| a.stats()),
    })
}

/// Handle `GET /ready`.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    // ---
    let workers = state.bus.live_workers();
    let expected = state.role.subscription_count();
    let (code, status) = readiness(state.bus.is_shutting_down(), workers, expected);

    (
        code,
        Json(ReadyResponse {
            status,
            workers,
            expected,
        }),
    )
}

fn readiness(shutting_down: bool, workers: usize, expected: usize) -> (StatusCode, &'static str) {
    // ---
    if shutting_down {
        (StatusCode::SERVICE_UNAVAILABLE, "stopping")
    } else if workers < expected {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    } else {
        (StatusCode::OK, "ready")
    }
}

/// Create a subrouter containing the `/health` and `/ready` routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_readiness_states() {
        // ---
        assert_eq!(readiness(false, 3, 3), (StatusCode::OK, "ready"));
        assert_eq!(
            readiness(false, 1, 3),
            (StatusCode::SERVICE_UNAVAILABLE, "starting")
        );
        assert_eq!(
            readiness(true, 3, 3),
            (StatusCode::SERVICE_UNAVAILABLE, "stopping")
        );
    }
}
