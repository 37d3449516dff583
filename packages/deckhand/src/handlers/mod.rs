pub mod configs;
pub mod health;
pub mod helm;
pub mod logs;
pub mod nodes;
pub mod watch;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use configs::lookup_configs;
pub use health::{health_live_handler, health_ready_handler, metrics_handler, ping_handler};
pub use helm::{get_helm_release, list_helm_releases};
pub use logs::{get_pod_logs, stop_pod_log_stream, stream_pod_logs};
pub use nodes::drain_node;
pub use watch::{watch_dynamic_resource, watch_events_dynamic_resource};
pub use websocket::websocket_handler;

use axum::Json;
use serde_json::{Value, json};

/// Body returned by every endpoint that only starts something.
pub(crate) fn success() -> Json<Value> {
    Json(json!({ "success": "" }))
}

/// The dashboard sends `""` for "not set".
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
