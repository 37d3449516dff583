//! Log Stream Controller
//!
//! Live tails are keyed by pod and namespace, so every dashboard looking at
//! the same pod shares one stream. The read loop races every read against the
//! stop token, which makes a stop effective even while the read is parked on
//! a quiet container.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, LogReader, PodLogRequest, PodRef};
use crate::envelope::{Envelope, names};
use crate::error::{RelayError, bounded};
use crate::hub::HubHandle;
use crate::registry::{StartOutcome, WatcherRegistry, WatcherStatus};
use crate::utf8::Utf8Decoder;

#[derive(Debug, Clone, Copy)]
pub struct LogStreamSettings {
    /// Size of each read, and so the upper bound of one envelope's `line`.
    pub chunk_bytes: usize,
    /// Pause after a read that produced nothing.
    pub idle_backoff: Duration,
    pub open_timeout: Duration,
}

impl Default for LogStreamSettings {
    fn default() -> Self {
        Self {
            chunk_bytes: 2000,
            idle_backoff: Duration::from_secs(1),
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Payload of a `pod_log_line_*` envelope. `line` is one read's worth of
/// output and may hold several lines or part of one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogChunk {
    pub container: String,
    pub pod: String,
    pub namespace: String,
    pub line: String,
}

#[derive(Clone)]
pub struct LogStreamController {
    api: Arc<dyn ClusterApi>,
    hub: HubHandle,
    registry: WatcherRegistry,
    settings: LogStreamSettings,
}

impl LogStreamController {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        hub: HubHandle,
        registry: WatcherRegistry,
        settings: LogStreamSettings,
    ) -> Self {
        Self {
            api,
            hub,
            registry,
            settings: LogStreamSettings {
                chunk_bytes: settings.chunk_bytes.max(1),
                ..settings
            },
        }
    }

    /// Registry key of a live tail. Equal to the event name it publishes.
    pub fn key(pod: &PodRef) -> String {
        names::pod_log_line(&pod.pod, &pod.namespace)
    }

    /// Start tailing `pod` from now on.
    pub async fn start(
        &self,
        cluster: &str,
        pod: PodRef,
        container: Option<String>,
    ) -> Result<StartOutcome, RelayError> {
        if !self.api.has_cluster(cluster) {
            return Err(RelayError::UnknownCluster(cluster.to_string()));
        }
        let key = Self::key(&pod);
        let api = self.api.clone();
        let hub = self.hub.clone();
        let settings = self.settings;
        let cluster = cluster.to_string();
        let listener_key = key.clone();

        self.registry
            .start_if_absent(&key, move |stop| async move {
                let request = PodLogRequest {
                    pod,
                    container,
                    follow: true,
                    tail_lines: Some(0),
                };
                let reader = bounded(
                    "open log stream",
                    settings.open_timeout,
                    api.open_pod_log_stream(&cluster, &request),
                )
                .await?;
                info!(key = %listener_key, cluster = %cluster, "log stream started");
                let chunk = LogChunk {
                    container: request.container.unwrap_or_default(),
                    pod: request.pod.pod,
                    namespace: request.pod.namespace,
                    line: String::new(),
                };
                Ok(pump(reader, chunk, listener_key, hub, stop, settings).boxed())
            })
            .await
    }

    /// Stop the live tail of `pod`. Unknown pods are a no-op.
    pub async fn stop(&self, pod: &PodRef) -> Option<WatcherStatus> {
        self.registry.stop(&Self::key(pod)).await
    }

    /// One-shot read of the last `tail_lines` lines (everything when `None`).
    /// Each returned line keeps its trailing newline; the last one may lack
    /// it.
    pub async fn snapshot(
        &self,
        cluster: &str,
        pod: PodRef,
        container: Option<String>,
        tail_lines: Option<i64>,
    ) -> Result<Vec<String>, RelayError> {
        if !self.api.has_cluster(cluster) {
            return Err(RelayError::UnknownCluster(cluster.to_string()));
        }
        let request = PodLogRequest {
            pod,
            container,
            follow: false,
            tail_lines,
        };
        let api = self.api.clone();
        bounded("read logs", self.settings.open_timeout, async move {
            let mut reader = api.open_pod_log_stream(cluster, &request).await?;
            let mut raw = Vec::new();
            reader
                .read_to_end(&mut raw)
                .await
                .map_err(RelayError::stream)?;
            Ok(String::from_utf8_lossy(&raw)
                .split_inclusive('\n')
                .map(str::to_string)
                .collect())
        })
        .await
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

async fn pump(
    mut reader: LogReader,
    template: LogChunk,
    key: String,
    hub: HubHandle,
    stop: CancellationToken,
    settings: LogStreamSettings,
) {
    let mut buf = vec![0u8; settings.chunk_bytes];
    let mut decoder = Utf8Decoder::new();

    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(key = %key, "log stream stopped");
                return;
            }
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                let rest = decoder.finish();
                if !rest.is_empty() {
                    publish(&hub, &key, &template, rest);
                }
                info!(key = %key, "log stream ended");
                return;
            }
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() && !publish(&hub, &key, &template, text) {
                    return;
                }
            }
            Err(err) if is_transient(err.kind()) => {
                debug!(key = %key, error = %err, "log stream idle");
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(settings.idle_backoff) => {}
                }
            }
            Err(err) => {
                warn!(key = %key, error = %err, "log stream failed");
                return;
            }
        }
    }
}

/// Returns `false` once the hub is gone.
fn publish(hub: &HubHandle, key: &str, template: &LogChunk, line: String) -> bool {
    let chunk = LogChunk {
        line,
        ..template.clone()
    };
    let result = Envelope::new(key, &chunk)
        .map_err(RelayError::from)
        .and_then(|envelope| hub.publish(&envelope));
    match result {
        Ok(()) => true,
        Err(RelayError::HubClosed) => false,
        Err(err) => {
            warn!(key, error = %err, "cannot publish log chunk");
            true
        }
    }
}
