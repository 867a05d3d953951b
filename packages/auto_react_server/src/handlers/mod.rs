pub mod health;
pub mod pairing;
pub mod reactors;
pub mod websocket;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

// Re-export all handlers for easy route registration
pub use health::{health_handler, metrics_handler};
pub use pairing::qr_handler;
pub use reactors::{list_reactors_handler, start_handler, stop_handler};
pub use websocket::logs_handler;

/// Every route the server exposes, without middleware layers.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/qr", post(qr_handler))
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/reactors", get(list_reactors_handler))
        .route("/logs", get(logs_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
