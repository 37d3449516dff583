use axum::{Json, extract::State, extract::rejection::JsonRejection};
use live_relay::RelayError;
use live_relay::cluster::DrainRequest;
use live_relay::drain::DrainReporter;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::AppState;
use crate::error::{ApiError, require};

#[derive(Debug, Deserialize)]
pub struct DrainBody {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default, rename = "resourceName")]
    pub resource_name: Option<String>,
    #[serde(default, rename = "resourceUid")]
    pub resource_uid: Option<String>,
    #[serde(default, rename = "drainForce")]
    pub drain_force: bool,
    #[serde(default, rename = "IgnoreAllDaemonSets")]
    pub ignore_all_daemon_sets: bool,
    #[serde(default, rename = "DeleteEmptyDirData")]
    pub delete_empty_dir_data: bool,
    /// Seconds; `0` waits indefinitely.
    #[serde(default, rename = "drainTimeout")]
    pub drain_timeout: u64,
}

/// Cordon and drain a node. Each removed pod is announced on
/// `drain_{node}_{uid}` while the request is in flight.
pub async fn drain_node(
    State(state): State<AppState>,
    payload: Result<Json<DrainBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let server = require(body.server.as_deref(), "server")?;
    let request = DrainRequest {
        node: require(body.resource_name.as_deref(), "resourceName")?.to_string(),
        node_uid: require(body.resource_uid.as_deref(), "resourceUid")?.to_string(),
        force: body.drain_force,
        ignore_daemon_sets: body.ignore_all_daemon_sets,
        delete_empty_dir_data: body.delete_empty_dir_data,
        timeout_secs: body.drain_timeout,
    };
    if !state.api.has_cluster(server) {
        return Err(RelayError::UnknownCluster(server.to_string()).into());
    }

    let reporter = DrainReporter::new(state.hub.clone(), &request.node, &request.node_uid);
    info!(cluster = server, node = %request.node, event = reporter.event(), "draining node");
    state.api.drain_node(server, &request, reporter).await?;
    Ok(Json(json!({ "success": request.node })))
}
