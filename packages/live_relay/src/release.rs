//! Release Change Bridge
//!
//! Release records live in secrets as base64 text of a gzip-compressed JSON
//! document. The bridge keeps one cache per cluster over that store and
//! republishes every add, update and delete as a `helm-release-*` envelope.
//! Caches start lazily on first use and are tracked in their own
//! [`WatcherRegistry`], keyed by cluster, so concurrent first requests share
//! one cache and a cache whose stream ends can be started again later.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::GzDecoder;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ReleaseStream, StoredRelease};
use crate::envelope::{Envelope, names};
use crate::error::{RelayError, bounded};
use crate::hub::HubHandle;
use crate::registry::{StartOutcome, WatcherRegistry};

const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("gzip: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("release record is not a JSON object")]
    NotAnObject,
}

/// A decoded release document, relayed exactly as stored. `name`, `namespace`
/// and `version` are only read, for picking the latest revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Release(Value);

impl Release {
    pub fn name(&self) -> &str {
        self.0.get("name").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.get("namespace").and_then(Value::as_str)
    }

    /// Revision number; `None` when absent or not an integer.
    pub fn version(&self) -> Option<i64> {
        self.0.get("version").and_then(Value::as_i64)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// base64, then gunzip, then JSON. Records written without compression are
/// accepted as plain JSON after the base64 step.
pub fn decode_release(record: &[u8]) -> Result<Release, DecodeError> {
    let raw = STANDARD.decode(record.trim_ascii())?;
    let json = if raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::with_capacity(raw.len() * 4);
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(DecodeError::Gzip)?;
        out
    } else {
        raw
    };
    let document: Value = serde_json::from_slice(&json)?;
    if !document.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    Ok(Release(document))
}

/// Highest revision of every release, sorted by name then namespace.
/// Undecodable records are skipped.
pub fn latest_revisions(records: &[StoredRelease]) -> Vec<Release> {
    let mut latest: HashMap<(String, String), Release> = HashMap::new();
    for stored in records {
        let release = match decode_release(&stored.record) {
            Ok(release) => release,
            Err(err) => {
                warn!(namespace = %stored.namespace, secret = %stored.name, error = %err, "skipping undecodable release record");
                continue;
            }
        };
        let namespace = release
            .namespace()
            .map_or_else(|| stored.namespace.clone(), str::to_string);
        let key = (namespace, release.name().to_string());
        match latest.get(&key) {
            Some(existing) if existing.version() >= release.version() => {}
            _ => {
                latest.insert(key, release);
            }
        }
    }

    let mut releases: Vec<(String, Release)> = latest
        .into_iter()
        .map(|((namespace, _), release)| (namespace, release))
        .collect();
    releases.sort_by(|(ns_a, a), (ns_b, b)| a.name().cmp(b.name()).then_with(|| ns_a.cmp(ns_b)));
    releases.into_iter().map(|(_, release)| release).collect()
}

#[derive(Clone)]
pub struct ReleaseChangeBridge {
    api: Arc<dyn ClusterApi>,
    hub: HubHandle,
    caches: WatcherRegistry,
    open_timeout: Duration,
}

impl ReleaseChangeBridge {
    pub fn new(api: Arc<dyn ClusterApi>, hub: HubHandle, open_timeout: Duration) -> Self {
        Self {
            api,
            hub,
            caches: WatcherRegistry::new(),
            open_timeout,
        }
    }

    /// Start the cache for `cluster` unless it is already running. Returns
    /// `true` if this call started it.
    pub async fn ensure_cache(&self, cluster: &str) -> Result<bool, RelayError> {
        if !self.api.has_cluster(cluster) {
            return Err(RelayError::UnknownCluster(cluster.to_string()));
        }
        let api = self.api.clone();
        let hub = self.hub.clone();
        let open_timeout = self.open_timeout;
        let owned = cluster.to_string();

        let outcome = self
            .caches
            .start_if_absent(cluster, move |stop| async move {
                let stream = bounded(
                    "open release cache",
                    open_timeout,
                    api.open_release_cache(&owned),
                )
                .await?;
                info!(cluster = %owned, "release cache started");
                Ok(relay(stream, owned, hub, stop).boxed())
            })
            .await?;
        Ok(outcome == StartOutcome::Started)
    }

    /// Latest revision of every release in `namespaces`. A namespace that
    /// cannot be listed is logged and skipped; no namespaces lists nothing.
    pub async fn list_releases(
        &self,
        cluster: &str,
        namespaces: &[String],
    ) -> Result<Vec<Release>, RelayError> {
        if !self.api.has_cluster(cluster) {
            return Err(RelayError::UnknownCluster(cluster.to_string()));
        }
        let mut records = Vec::new();
        for namespace in namespaces {
            match self.list_records(cluster, namespace).await {
                Ok(found) => records.extend(found),
                Err(err) => {
                    warn!(cluster, namespace = %namespace, error = %err, "cannot list releases");
                }
            }
        }
        Ok(latest_revisions(&records))
    }

    /// Latest revision of one release, if it exists.
    pub async fn get_release(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Release>, RelayError> {
        let records = self.list_records(cluster, namespace).await?;
        Ok(latest_revisions(&records)
            .into_iter()
            .find(|release| release.name() == name))
    }

    async fn list_records(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<StoredRelease>, RelayError> {
        bounded(
            "list releases",
            self.open_timeout,
            self.api.list_release_records(cluster, namespace),
        )
        .await
    }

    /// Clusters with a running cache.
    pub async fn active_caches(&self) -> Vec<String> {
        self.caches.keys().await
    }

    pub async fn shutdown(&self) -> usize {
        self.caches.stop_all().await
    }
}

async fn relay(mut stream: ReleaseStream, cluster: String, hub: HubHandle, stop: CancellationToken) {
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(cluster = %cluster, "release cache stopped");
                return;
            }
            item = stream.next() => item,
        };

        let notification = match item {
            None => {
                info!(cluster = %cluster, "release cache stream ended");
                return;
            }
            Some(Err(err)) => {
                warn!(cluster = %cluster, error = %err, "release notification failed");
                continue;
            }
            Some(Ok(notification)) => notification,
        };

        let release = match decode_release(&notification.record) {
            Ok(release) => release,
            Err(err) => {
                warn!(
                    cluster = %cluster,
                    namespace = %notification.namespace,
                    secret = %notification.name,
                    action = %notification.action,
                    error = %err,
                    "dropping undecodable release"
                );
                continue;
            }
        };

        let published = Envelope::new(names::helm_release(&cluster, notification.action), &release)
            .map_err(RelayError::from)
            .and_then(|envelope| hub.publish(&envelope));
        match published {
            Ok(()) => debug!(cluster = %cluster, release = %release.name(), action = %notification.action, "release change published"),
            Err(RelayError::HubClosed) => return,
            Err(err) => warn!(cluster = %cluster, error = %err, "cannot publish release change"),
        }
    }
}
