use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;

pub async fn ping_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "pong" }))
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.stats().await.ok();
    let active = state.registry.len().await;
    Json(state.metrics.snapshot(hub, active))
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - returns 200 while the broadcast hub is running
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    if state.hub.is_running() {
        Json(serde_json::json!({ "message": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "message": "broadcast hub is not running" })),
        )
            .into_response()
    }
}
