//! Route registration for the gateway API

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::core::PollingRegistry;

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PollingRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<PollingRegistry>) -> Self {
        Self { registry }
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::service_status))
        .route("/devices/{id}/test", post(handlers::test_device))
        .route("/devices/{id}/read", get(handlers::read_device))
        .route("/devices/{id}/polling/start", post(handlers::start_polling))
        .route("/devices/{id}/polling/stop", post(handlers::stop_polling))
        .route("/devices/{id}/data", get(handlers::device_data))
        .route("/devices/{id}/control", post(handlers::control_device))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
