use std::sync::Arc;
use std::time::Duration;

use live_relay::hub::{self, HubConfig};
use live_relay::log_stream::LogStreamSettings;
use live_relay::testing::FakeCluster;
use tokio_util::sync::CancellationToken;

use crate::AppState;
use crate::config::RelaySettings;

/// Build a fully-wired `AppState` over `fake`, with a running hub.
///
/// Cancelling the returned token shuts the hub down.
pub fn test_app_state(fake: FakeCluster) -> (AppState, CancellationToken) {
    let shutdown = CancellationToken::new();
    let relay = RelaySettings {
        hub: HubConfig::default(),
        logs: LogStreamSettings {
            chunk_bytes: 2000,
            idle_backoff: Duration::from_millis(10),
            open_timeout: Duration::from_secs(5),
        },
        api_request_timeout: Duration::from_secs(5),
    };
    let (hub, _task) = hub::spawn(relay.hub, shutdown.clone());
    (AppState::new(Arc::new(fake), hub, &relay), shutdown)
}

/// POST a JSON body and return the status with the parsed response body.
pub async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (axum::http::StatusCode, serde_json::Value) {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// GET `uri` and return the status with the parsed response body.
pub async fn get_json(app: axum::Router, uri: &str) -> (axum::http::StatusCode, serde_json::Value) {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}
