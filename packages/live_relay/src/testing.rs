//! Scripted in-memory [`ClusterApi`] for tests.
//!
//! Every stream the fake opens is backed by a channel whose sending half the
//! test can pick up afterwards, so tests drive events by hand and can count
//! how many streams were really opened.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, mpsc};

use crate::cluster::{
    ClusterApi, DrainRequest, GroupVersionKind, LogReader, PodLogRequest, PodRef,
    ReleaseNotification, ReleaseStream, StoredRelease, WatchEvent, WatchStream, WatchTarget,
};
use crate::drain::DrainReporter;
use crate::error::RelayError;

pub type WatchSender = mpsc::UnboundedSender<Result<WatchEvent, RelayError>>;
pub type ReleaseSender = mpsc::UnboundedSender<Result<ReleaseNotification, RelayError>>;

#[derive(Default)]
struct State {
    missing_kinds: HashSet<String>,
    open_error: Option<String>,
    open_delay: Option<Duration>,
    watch_opens: Vec<(String, WatchTarget)>,
    watch_senders: Vec<WatchSender>,
    log_opens: Vec<(String, PodLogRequest)>,
    log_readers: VecDeque<LogReader>,
    release_opens: Vec<String>,
    release_senders: HashMap<String, ReleaseSender>,
    stored_releases: Vec<StoredRelease>,
    drains: Vec<(String, DrainRequest)>,
    drain_pods: Vec<PodRef>,
}

#[derive(Clone)]
pub struct FakeCluster {
    clusters: Vec<String>,
    state: Arc<Mutex<State>>,
}

fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

impl FakeCluster {
    pub fn new<I, S>(clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clusters: clusters.into_iter().map(Into::into).collect(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Make discovery fail for `kind`.
    pub async fn hide_kind(&self, kind: &str) {
        self.state.lock().await.missing_kinds.insert(kind.to_string());
    }

    /// Fail every following open with an `Api` error (`None` to clear).
    pub async fn fail_opens(&self, message: Option<&str>) {
        self.state.lock().await.open_error = message.map(str::to_string);
    }

    /// Delay every following open.
    pub async fn delay_opens(&self, delay: Duration) {
        self.state.lock().await.open_delay = Some(delay);
    }

    /// Queue the reader handed out by the next log stream open.
    pub async fn push_log_reader(&self, reader: LogReader) {
        self.state.lock().await.log_readers.push_back(reader);
    }

    pub async fn store_release(&self, release: StoredRelease) {
        self.state.lock().await.stored_releases.push(release);
    }

    /// Pods the next drains report as evicted.
    pub async fn set_drain_pods(&self, pods: Vec<PodRef>) {
        self.state.lock().await.drain_pods = pods;
    }

    pub async fn watch_opens(&self) -> Vec<(String, WatchTarget)> {
        self.state.lock().await.watch_opens.clone()
    }

    /// Sending half of the `index`-th watch stream opened.
    pub async fn watch_sender(&self, index: usize) -> Option<WatchSender> {
        self.state.lock().await.watch_senders.get(index).cloned()
    }

    /// End the `index`-th watch stream by dropping its sender.
    pub async fn close_watch(&self, index: usize) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.watch_senders.get_mut(index) {
            let (closed, _) = mpsc::unbounded_channel();
            *slot = closed;
        }
    }

    pub async fn log_opens(&self) -> Vec<(String, PodLogRequest)> {
        self.state.lock().await.log_opens.clone()
    }

    pub async fn release_opens(&self) -> Vec<String> {
        self.state.lock().await.release_opens.clone()
    }

    pub async fn release_sender(&self, cluster: &str) -> Option<ReleaseSender> {
        self.state.lock().await.release_senders.get(cluster).cloned()
    }

    /// End the release stream of `cluster` by dropping its sender.
    pub async fn close_release_stream(&self, cluster: &str) {
        self.state.lock().await.release_senders.remove(cluster);
    }

    pub async fn drains(&self) -> Vec<(String, DrainRequest)> {
        self.state.lock().await.drains.clone()
    }

    async fn before_open(&self, cluster: &str) -> Result<(), RelayError> {
        if !self.has_cluster(cluster) {
            return Err(RelayError::UnknownCluster(cluster.to_string()));
        }
        let (error, delay) = {
            let state = self.state.lock().await;
            (state.open_error.clone(), state.open_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(message) => Err(RelayError::Api(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn clusters(&self) -> Vec<String> {
        self.clusters.clone()
    }

    async fn resolve_plural_name(
        &self,
        cluster: &str,
        gvk: &GroupVersionKind,
    ) -> Result<String, RelayError> {
        if !self.has_cluster(cluster) {
            return Err(RelayError::UnknownCluster(cluster.to_string()));
        }
        if self.state.lock().await.missing_kinds.contains(&gvk.kind) {
            return Err(RelayError::KindNotFound {
                group_version: gvk.api_version(),
                kind: gvk.kind.clone(),
            });
        }
        Ok(format!("{}s", gvk.kind.to_lowercase()))
    }

    async fn open_watch(
        &self,
        cluster: &str,
        target: &WatchTarget,
    ) -> Result<WatchStream, RelayError> {
        self.before_open(cluster).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.watch_opens.push((cluster.to_string(), target.clone()));
        state.watch_senders.push(tx);
        Ok(channel_stream(rx))
    }

    async fn open_pod_log_stream(
        &self,
        cluster: &str,
        request: &PodLogRequest,
    ) -> Result<LogReader, RelayError> {
        self.before_open(cluster).await?;
        let mut state = self.state.lock().await;
        state.log_opens.push((cluster.to_string(), request.clone()));
        state
            .log_readers
            .pop_front()
            .ok_or_else(|| RelayError::stream(format!("no logs for {}", request.pod.pod)))
    }

    async fn open_release_cache(&self, cluster: &str) -> Result<ReleaseStream, RelayError> {
        self.before_open(cluster).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.release_opens.push(cluster.to_string());
        state.release_senders.insert(cluster.to_string(), tx);
        Ok(channel_stream(rx))
    }

    async fn list_release_records(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<StoredRelease>, RelayError> {
        self.before_open(cluster).await?;
        let state = self.state.lock().await;
        Ok(state
            .stored_releases
            .iter()
            .filter(|r| r.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn drain_node(
        &self,
        cluster: &str,
        request: &DrainRequest,
        reporter: DrainReporter,
    ) -> Result<(), RelayError> {
        self.before_open(cluster).await?;
        let pods = {
            let mut state = self.state.lock().await;
            state.drains.push((cluster.to_string(), request.clone()));
            state.drain_pods.clone()
        };
        for pod in pods {
            reporter.pod_evicted(&pod.pod, &pod.namespace, true)?;
        }
        Ok(())
    }
}

/// Encode `release` the way the release store does: JSON, gzip, base64.
pub fn release_record(release: &serde_json::Value) -> Vec<u8> {
    use base64::Engine;
    use std::io::Write;

    let json = serde_json::to_vec(release).expect("serialize release");
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&json).expect("gzip write");
    let compressed = gz.finish().expect("gzip finish");
    base64::engine::general_purpose::STANDARD
        .encode(compressed)
        .into_bytes()
}
