use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let active_reactors = state.registry.len().await as u64;
    Json(
        state
            .metrics
            .snapshot(active_reactors, state.events.dropped_observers()),
    )
}
