use crate::metrics::MonitorMetrics;
use crate::state::HealthState;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use std::sync::Arc;
use tracing::error;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthState>,
    pub metrics: Arc<MonitorMetrics>,
}

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Liveness: 503 once the monitor has hit a structural failure.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.health.is_healthy();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, flag(healthy))
}

/// Result of the latest probe cycle.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health.status();
    let code = if status {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (code, flag(status))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}
