use axum::{Json, extract::State, extract::rejection::JsonRejection};
use live_relay::cluster::PodRef;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{non_empty, success};
use crate::AppState;
use crate::error::{ApiError, require};

#[derive(Debug, Deserialize)]
pub struct PodLogBody {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub tail_lines: Option<i64>,
}

impl PodLogBody {
    fn pod(&self) -> Result<(String, PodRef), ApiError> {
        let server = require(self.server.as_deref(), "server")?.to_string();
        let pod = PodRef::new(
            require(self.namespace.as_deref(), "namespace")?,
            require(self.name.as_deref(), "name")?,
        );
        Ok((server, pod))
    }
}

/// Start (or join) the live tail of a pod.
pub async fn stream_pod_logs(
    State(state): State<AppState>,
    payload: Result<Json<PodLogBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let (server, pod) = body.pod()?;
    let outcome = state
        .logs
        .start(&server, pod, non_empty(body.container))
        .await?;
    if outcome.started() {
        state.metrics.log_stream_started();
    }
    Ok(success())
}

/// Stop the live tail of a pod. Stopping a pod that is not tailed succeeds.
pub async fn stop_pod_log_stream(
    State(state): State<AppState>,
    payload: Result<Json<PodLogBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let (_, pod) = body.pod()?;
    match state.logs.stop(&pod).await {
        Some(_) => state.metrics.log_stream_stopped(),
        None => debug!(pod = %pod.pod, namespace = %pod.namespace, "no log stream to stop"),
    }
    Ok(success())
}

/// Read the last lines of a pod's log once.
pub async fn get_pod_logs(
    State(state): State<AppState>,
    payload: Result<Json<PodLogBody>, JsonRejection>,
) -> Result<Json<Vec<String>>, ApiError> {
    let Json(body) = payload?;
    let (server, pod) = body.pod()?;
    let lines = state
        .logs
        .snapshot(&server, pod, non_empty(body.container), body.tail_lines)
        .await?;
    Ok(Json(lines))
}
