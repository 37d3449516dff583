//! Boundary to the cluster client.
//!
//! The relay core never talks to a control plane directly. Everything it
//! needs is behind [`ClusterApi`]; `deckhand` implements it on top of a real
//! client and the tests implement it with in-memory streams.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncRead;

use crate::drain::DrainReporter;
use crate::envelope::ReleaseAction;
use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// Empty for the core group.
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// `apiVersion` as it appears on objects: `group/version`, or just
    /// `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. `deployments`.
    pub resource: String,
}

/// Parameters for one watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub gvk: GroupVersionKind,
    pub resource: GroupVersionResource,
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
    pub resource_version: String,
    pub field_selector: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    /// Server-side failure reported inside the stream. Terminal.
    Error(String),
}

/// Items of a watch stream. An `Err` item is a single undecodable event;
/// the end of the stream is terminal.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, RelayError>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub pod: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodLogRequest {
    pub pod: PodRef,
    pub container: Option<String>,
    pub follow: bool,
    /// `Some(0)` starts a followed stream from "now".
    pub tail_lines: Option<i64>,
}

pub type LogReader = Pin<Box<dyn AsyncRead + Send>>;

/// One change in the secret-backed release store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseNotification {
    pub action: ReleaseAction,
    pub namespace: String,
    pub name: String,
    /// Base64 text of the gzip-compressed JSON release.
    pub record: Vec<u8>,
}

pub type ReleaseStream = BoxStream<'static, Result<ReleaseNotification, RelayError>>;

/// A raw release record as stored, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRelease {
    pub namespace: String,
    pub name: String,
    pub record: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainRequest {
    pub node: String,
    pub node_uid: String,
    /// Delete pods that have no managing controller.
    pub force: bool,
    pub ignore_daemon_sets: bool,
    pub delete_empty_dir_data: bool,
    /// Seconds to wait for evicted pods to disappear. `0` waits indefinitely.
    pub timeout_secs: u64,
}

#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Identities of every configured cluster.
    fn clusters(&self) -> Vec<String>;

    fn has_cluster(&self, cluster: &str) -> bool {
        self.clusters().iter().any(|c| c == cluster)
    }

    /// Discovery: plural resource name for a kind.
    async fn resolve_plural_name(
        &self,
        cluster: &str,
        gvk: &GroupVersionKind,
    ) -> Result<String, RelayError>;

    async fn open_watch(&self, cluster: &str, target: &WatchTarget)
    -> Result<WatchStream, RelayError>;

    async fn open_pod_log_stream(
        &self,
        cluster: &str,
        request: &PodLogRequest,
    ) -> Result<LogReader, RelayError>;

    /// Start a cache over the release store of `cluster`. The stream yields
    /// one notification per add, update or delete for as long as the cache
    /// runs.
    async fn open_release_cache(&self, cluster: &str) -> Result<ReleaseStream, RelayError>;

    /// Every stored release record in one namespace.
    async fn list_release_records(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<StoredRelease>, RelayError>;

    /// Cordon and evict, reporting each pod as it goes.
    async fn drain_node(
        &self,
        cluster: &str,
        request: &DrainRequest,
        reporter: DrainReporter,
    ) -> Result<(), RelayError>;
}
