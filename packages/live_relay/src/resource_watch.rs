//! Resource Watch Bridge
//!
//! Turns one watch stream into envelopes. Two flavours share the same
//! lifecycle: a plain watch over a kind, keyed by `{kind}-{cluster}`, and an
//! object-events watch over the events of one object, keyed by
//! `{uid}-{cluster}`. A watch ends on a server-side `Error` event, when the
//! stream closes, or when it is stopped; it never restarts by itself.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, GroupVersionKind, GroupVersionResource, WatchEvent, WatchStream, WatchTarget};
use crate::envelope::{Envelope, names};
use crate::error::{RelayError, bounded};
use crate::hub::HubHandle;
use crate::registry::{StartOutcome, WatcherRegistry, WatcherStatus};

/// Resource version used when the caller has none: any cached version.
const ANY_RESOURCE_VERSION: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceWatchRequest {
    pub cluster: String,
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub resource_version: Option<String>,
}

impl ResourceWatchRequest {
    pub fn key(&self) -> String {
        format!("{}-{}", self.gvk.kind, self.cluster)
    }
}

/// Watch of the events that involve one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEventsRequest {
    pub cluster: String,
    pub uid: String,
    /// The event kind to watch, `v1/Event` or `events.k8s.io/v1/Event`.
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub resource_version: Option<String>,
}

impl ObjectEventsRequest {
    pub fn key(&self) -> String {
        format!("{}-{}", self.uid, self.cluster)
    }

    /// Core events reference the object as `involvedObject`, the
    /// `events.k8s.io` group calls it `regarding`.
    pub fn field_selector(&self) -> String {
        if self.gvk.group.is_empty() {
            format!("involvedObject.uid={}", self.uid)
        } else {
            format!("regarding.uid={}", self.uid)
        }
    }
}

/// Where a watch publishes.
#[derive(Debug, Clone)]
struct Route {
    updated: String,
    /// `None` when deletions are not relayed.
    deleted: Option<String>,
}

/// Everything needed to open one watch.
struct Plan {
    key: String,
    cluster: String,
    gvk: GroupVersionKind,
    namespace: Option<String>,
    resource_version: Option<String>,
    field_selector: Option<String>,
    route: Route,
}

#[derive(Clone)]
pub struct ResourceWatchBridge {
    api: Arc<dyn ClusterApi>,
    hub: HubHandle,
    registry: WatcherRegistry,
    open_timeout: Duration,
}

impl ResourceWatchBridge {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        hub: HubHandle,
        registry: WatcherRegistry,
        open_timeout: Duration,
    ) -> Self {
        Self {
            api,
            hub,
            registry,
            open_timeout,
        }
    }

    /// Start a plain watch. Added and modified objects are published as
    /// `{kind}-{cluster}-updated`, deleted ones as `{kind}-{cluster}-deleted`.
    pub async fn watch(&self, request: ResourceWatchRequest) -> Result<StartOutcome, RelayError> {
        let route = Route {
            updated: names::resource_updated(&request.gvk.kind, &request.cluster),
            deleted: Some(names::resource_deleted(&request.gvk.kind, &request.cluster)),
        };
        self.start(Plan {
            key: request.key(),
            cluster: request.cluster,
            gvk: request.gvk,
            namespace: request.namespace,
            resource_version: request.resource_version,
            field_selector: None,
            route,
        })
        .await
    }

    /// Start an object-events watch, published as `{uid}-{cluster}-updated`.
    /// Deletions of events are not relayed.
    pub async fn watch_object_events(
        &self,
        request: ObjectEventsRequest,
    ) -> Result<StartOutcome, RelayError> {
        let route = Route {
            updated: names::object_events_updated(&request.uid, &request.cluster),
            deleted: None,
        };
        self.start(Plan {
            key: request.key(),
            field_selector: Some(request.field_selector()),
            cluster: request.cluster,
            gvk: request.gvk,
            namespace: request.namespace,
            resource_version: request.resource_version,
            route,
        })
        .await
    }

    pub async fn stop(&self, key: &str) -> Option<WatcherStatus> {
        self.registry.stop(key).await
    }

    async fn start(&self, plan: Plan) -> Result<StartOutcome, RelayError> {
        let Plan {
            key,
            cluster,
            gvk,
            namespace,
            resource_version,
            field_selector,
            route,
        } = plan;
        if !self.api.has_cluster(&cluster) {
            return Err(RelayError::UnknownCluster(cluster));
        }
        let api = self.api.clone();
        let hub = self.hub.clone();
        let open_timeout = self.open_timeout;
        let listener_key = key.clone();

        self.registry
            .start_if_absent(&key, move |stop| async move {
                let plural = bounded(
                    "resolve resource",
                    open_timeout,
                    api.resolve_plural_name(&cluster, &gvk),
                )
                .await?;
                let target = WatchTarget {
                    resource: GroupVersionResource {
                        group: gvk.group.clone(),
                        version: gvk.version.clone(),
                        resource: plural,
                    },
                    gvk,
                    namespace,
                    resource_version: resource_version
                        .filter(|rv| !rv.is_empty())
                        .unwrap_or_else(|| ANY_RESOURCE_VERSION.to_string()),
                    field_selector,
                };
                let stream = bounded("open watch", open_timeout, api.open_watch(&cluster, &target)).await?;
                info!(
                    key = %listener_key,
                    cluster = %cluster,
                    resource = %target.resource.resource,
                    namespace = target.namespace.as_deref().unwrap_or("*"),
                    "watching"
                );
                Ok(relay(stream, target.gvk, route, hub, stop, listener_key).boxed())
            })
            .await
    }
}

/// Stamp `kind` and `apiVersion` on an object. Watch payloads from the
/// dynamic API do not reliably carry them.
fn tag(mut object: Value, gvk: &GroupVersionKind, api_version: &str) -> Value {
    if let Value::Object(map) = &mut object {
        map.insert("kind".into(), Value::String(gvk.kind.clone()));
        map.insert("apiVersion".into(), Value::String(api_version.to_string()));
    }
    object
}

async fn relay(
    mut stream: WatchStream,
    gvk: GroupVersionKind,
    route: Route,
    hub: HubHandle,
    stop: CancellationToken,
    key: String,
) {
    let api_version = gvk.api_version();
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(key = %key, "watch stopped");
                return;
            }
            item = stream.next() => item,
        };

        let (event, object) = match item {
            None => {
                info!(key = %key, "watch stream closed");
                return;
            }
            Some(Err(err)) => {
                warn!(key = %key, error = %err, "skipping watch event");
                continue;
            }
            Some(Ok(WatchEvent::Error(message))) => {
                error!(key = %key, error = %message, "watch failed");
                return;
            }
            Some(Ok(WatchEvent::Added(object) | WatchEvent::Modified(object))) => {
                (&route.updated, object)
            }
            Some(Ok(WatchEvent::Deleted(object))) => match &route.deleted {
                Some(event) => (event, object),
                None => continue,
            },
        };

        debug!(key = %key, event = %event, "relaying watch event");
        let envelope = Envelope::from_value(event.as_str(), tag(object, &gvk, &api_version));
        match hub.publish(&envelope) {
            Ok(()) => {}
            Err(RelayError::HubClosed) => return,
            Err(err) => warn!(key = %key, error = %err, "cannot publish watch event"),
        }
    }
}
