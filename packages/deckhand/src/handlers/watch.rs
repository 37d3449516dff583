use axum::{Json, extract::State, extract::rejection::JsonRejection};
use live_relay::cluster::GroupVersionKind;
use live_relay::resource_watch::{ObjectEventsRequest, ResourceWatchRequest};
use live_relay::{RelayError, StartOutcome};
use serde::Deserialize;
use serde_json::Value;

use super::{non_empty, success};
use crate::AppState;
use crate::error::{ApiError, require};

#[derive(Debug, Default, Deserialize)]
pub struct ApiResourceBody {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
}

impl ApiResourceBody {
    fn gvk(&self) -> Result<GroupVersionKind, ApiError> {
        Ok(GroupVersionKind::new(
            self.group.as_deref().unwrap_or_default().trim(),
            require(self.version.as_deref(), "apiResource.version")?,
            require(self.kind.as_deref(), "apiResource.kind")?,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct WatchBody {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, rename = "apiResource")]
    pub api_resource: ApiResourceBody,
}

fn record(state: &AppState, outcome: Result<StartOutcome, RelayError>) -> Result<Json<Value>, ApiError> {
    match outcome {
        Ok(outcome) => {
            state.metrics.watch_started(outcome.started());
            Ok(success())
        }
        Err(err) => {
            state.metrics.watch_failed();
            Err(err.into())
        }
    }
}

/// Start (or join) a watch over every object of a kind.
pub async fn watch_dynamic_resource(
    State(state): State<AppState>,
    payload: Result<Json<WatchBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let request = ResourceWatchRequest {
        cluster: require(body.server.as_deref(), "server")?.to_string(),
        gvk: body.api_resource.gvk()?,
        namespace: non_empty(body.namespace),
        resource_version: non_empty(body.api_resource.resource_version),
    };
    let outcome = state.watches.watch(request).await;
    record(&state, outcome)
}

/// Start (or join) a watch over the events of one object.
pub async fn watch_events_dynamic_resource(
    State(state): State<AppState>,
    payload: Result<Json<WatchBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let request = ObjectEventsRequest {
        cluster: require(body.server.as_deref(), "server")?.to_string(),
        uid: require(body.uid.as_deref(), "uid")?.to_string(),
        gvk: body.api_resource.gvk()?,
        namespace: non_empty(body.namespace),
        resource_version: non_empty(body.api_resource.resource_version),
    };
    let outcome = state.watches.watch_object_events(request).await;
    record(&state, outcome)
}
