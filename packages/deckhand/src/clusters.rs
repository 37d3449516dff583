//! Cluster client adapter
//!
//! Implements the relay's [`ClusterApi`] on top of one `kube::Client` per
//! configured cluster. Clusters are identified by their configured `name`,
//! falling back to the API server URL.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind as KubeGvk, ListParams, LogParams,
    WatchEvent as KubeWatchEvent, WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Config};
use live_relay::cluster::{
    DrainRequest, GroupVersionKind, LogReader, PodLogRequest, ReleaseNotification, ReleaseStream,
    StoredRelease, WatchEvent, WatchStream, WatchTarget,
};
use live_relay::drain::DrainReporter;
use live_relay::envelope::ReleaseAction;
use live_relay::{ClusterApi, RelayError};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info};

use crate::config::ClusterFileConfig;

/// Field selector matching the secrets of the release store.
const RELEASE_SECRET_SELECTOR: &str = "type=helm.sh/release.v1";
/// Secret data entry holding the encoded release.
const RELEASE_DATA_KEY: &str = "release";

struct KubeCluster {
    name: String,
    client: Client,
}

pub struct KubeClusters {
    clusters: Vec<KubeCluster>,
}

impl KubeClusters {
    /// Build a client for every entry. Fails on an unreadable kubeconfig,
    /// a missing context, or two entries resolving to the same name.
    pub async fn connect(entries: &[ClusterFileConfig]) -> Result<Self> {
        let mut clusters: Vec<KubeCluster> = Vec::with_capacity(entries.len());
        for entry in entries {
            let kubeconfig = Kubeconfig::read_from(&entry.kubeconfig)
                .with_context(|| format!("reading kubeconfig {}", entry.kubeconfig.display()))?;
            let options = KubeConfigOptions {
                context: entry.context.clone(),
                ..Default::default()
            };
            let config = Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .with_context(|| format!("loading kubeconfig {}", entry.kubeconfig.display()))?;
            let name = entry
                .name
                .clone()
                .unwrap_or_else(|| server_name(&config.cluster_url.to_string()));
            if clusters.iter().any(|c| c.name == name) {
                bail!("cluster {name} is configured twice");
            }
            let client = Client::try_from(config)
                .with_context(|| format!("building client for {name}"))?;
            info!(cluster = %name, kubeconfig = %entry.kubeconfig.display(), "cluster configured");
            clusters.push(KubeCluster { name, client });
        }
        Ok(Self { clusters })
    }

    fn client(&self, cluster: &str) -> Result<Client, RelayError> {
        self.clusters
            .iter()
            .find(|c| c.name == cluster)
            .map(|c| c.client.clone())
            .ok_or_else(|| RelayError::UnknownCluster(cluster.to_string()))
    }
}

/// `https://10.0.0.1:6443/` and `https://10.0.0.1:6443` name the same
/// server.
fn server_name(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn kube_gvk(gvk: &GroupVersionKind) -> KubeGvk {
    KubeGvk::gvk(&gvk.group, &gvk.version, &gvk.kind)
}

fn watch_event(event: kube::Result<KubeWatchEvent<DynamicObject>>) -> Option<Result<WatchEvent, RelayError>> {
    let event = match event {
        Ok(event) => event,
        Err(err) => return Some(Err(RelayError::stream(err))),
    };
    let converted = match event {
        KubeWatchEvent::Added(obj) => serde_json::to_value(obj).map(WatchEvent::Added),
        KubeWatchEvent::Modified(obj) => serde_json::to_value(obj).map(WatchEvent::Modified),
        KubeWatchEvent::Deleted(obj) => serde_json::to_value(obj).map(WatchEvent::Deleted),
        KubeWatchEvent::Bookmark(_) => return None,
        KubeWatchEvent::Error(status) => Ok(WatchEvent::Error(status.message)),
    };
    Some(converted.map_err(RelayError::from))
}

#[async_trait]
impl ClusterApi for KubeClusters {
    fn clusters(&self) -> Vec<String> {
        self.clusters.iter().map(|c| c.name.clone()).collect()
    }

    async fn resolve_plural_name(
        &self,
        cluster: &str,
        gvk: &GroupVersionKind,
    ) -> Result<String, RelayError> {
        let client = self.client(cluster)?;
        match kube::discovery::pinned_kind(&client, &kube_gvk(gvk)).await {
            Ok((resource, _)) => Ok(resource.plural),
            Err(kube::Error::Discovery(_)) => Err(RelayError::KindNotFound {
                group_version: gvk.api_version(),
                kind: gvk.kind.clone(),
            }),
            Err(err) => Err(RelayError::api(err)),
        }
    }

    async fn open_watch(&self, cluster: &str, target: &WatchTarget) -> Result<WatchStream, RelayError> {
        let client = self.client(cluster)?;
        let resource =
            ApiResource::from_gvk_with_plural(&kube_gvk(&target.gvk), &target.resource.resource);
        let api: Api<DynamicObject> = match &target.namespace {
            Some(namespace) => Api::namespaced_with(client, namespace, &resource),
            None => Api::all_with(client, &resource),
        };
        let mut params = WatchParams::default();
        if let Some(selector) = &target.field_selector {
            params = params.fields(selector);
        }
        let events = api
            .watch(&params, &target.resource_version)
            .await
            .map_err(RelayError::api)?;
        Ok(events
            .filter_map(|event| future::ready(watch_event(event)))
            .boxed())
    }

    async fn open_pod_log_stream(
        &self,
        cluster: &str,
        request: &PodLogRequest,
    ) -> Result<LogReader, RelayError> {
        let client = self.client(cluster)?;
        let pods: Api<Pod> = Api::namespaced(client, &request.pod.namespace);
        let params = LogParams {
            container: request.container.clone(),
            follow: request.follow,
            tail_lines: request.tail_lines,
            ..Default::default()
        };
        let reader = pods
            .log_stream(&request.pod.pod, &params)
            .await
            .map_err(RelayError::api)?;
        Ok(Box::pin(reader.compat()))
    }

    async fn open_release_cache(&self, cluster: &str) -> Result<ReleaseStream, RelayError> {
        let client = self.client(cluster)?;
        let secrets: Api<Secret> = Api::all(client);
        let config = watcher::Config::default().fields(RELEASE_SECRET_SELECTOR);
        debug!(cluster, "watching release store");
        Ok(watcher(secrets, config)
            .default_backoff()
            .scan(ReleaseMirror::default(), |mirror, event| {
                let batch: Vec<Result<ReleaseNotification, RelayError>> = match event {
                    Ok(event) => mirror.handle(event).into_iter().map(Ok).collect(),
                    Err(err) => vec![Err(RelayError::stream(err))],
                };
                future::ready(Some(stream::iter(batch)))
            })
            .flatten()
            .boxed())
    }

    async fn list_release_records(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<StoredRelease>, RelayError> {
        let secrets: Api<Secret> = Api::namespaced(self.client(cluster)?, namespace);
        let list = secrets
            .list(&ListParams::default().fields(RELEASE_SECRET_SELECTOR))
            .await
            .map_err(RelayError::api)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|secret| {
                let parts = SecretParts::from_secret(secret)?;
                Some(StoredRelease {
                    namespace: parts.namespace,
                    name: parts.name,
                    record: parts.record?,
                })
            })
            .collect())
    }

    async fn drain_node(
        &self,
        cluster: &str,
        request: &DrainRequest,
        reporter: DrainReporter,
    ) -> Result<(), RelayError> {
        let client = self.client(cluster)?;
        crate::drain::drain_node(client, request, &reporter).await
    }
}

// =============================================================================
// Release mirror
// =============================================================================

/// The fields of a release secret the mirror cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SecretParts {
    namespace: String,
    name: String,
    record: Option<Vec<u8>>,
}

impl SecretParts {
    fn from_secret(secret: Secret) -> Option<Self> {
        let name = secret.metadata.name?;
        let namespace = secret.metadata.namespace.unwrap_or_default();
        let record = secret
            .data
            .and_then(|mut data: BTreeMap<String, ByteString>| data.remove(RELEASE_DATA_KEY))
            .map(|bytes| bytes.0);
        Some(Self {
            namespace,
            name,
            record,
        })
    }
}

type SecretKey = (String, String);

/// Turns the raw apply/delete/relist events of a secret watch into
/// added/updated/deleted notifications, remembering the last record of every
/// secret it has seen.
#[derive(Debug, Default)]
pub struct ReleaseMirror {
    known: HashMap<SecretKey, Vec<u8>>,
    /// Keys seen since the current relist started.
    relist: Option<HashSet<SecretKey>>,
}

impl ReleaseMirror {
    pub fn handle(&mut self, event: watcher::Event<Secret>) -> Vec<ReleaseNotification> {
        match event {
            watcher::Event::Apply(secret) => SecretParts::from_secret(secret)
                .and_then(|parts| self.applied(parts))
                .into_iter()
                .collect(),
            watcher::Event::Delete(secret) => SecretParts::from_secret(secret)
                .and_then(|parts| self.deleted(parts))
                .into_iter()
                .collect(),
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(secret) => SecretParts::from_secret(secret)
                .and_then(|parts| {
                    if let Some(seen) = self.relist.as_mut() {
                        seen.insert((parts.namespace.clone(), parts.name.clone()));
                    }
                    self.applied(parts)
                })
                .into_iter()
                .collect(),
            watcher::Event::InitDone => self.relist_done(),
        }
    }

    /// First sighting of a secret is an add, any later one an update.
    /// Secrets without a record are ignored.
    fn applied(&mut self, parts: SecretParts) -> Option<ReleaseNotification> {
        let record = parts.record?;
        let key = (parts.namespace, parts.name);
        let action = match self.known.insert(key.clone(), record.clone()) {
            None => ReleaseAction::Added,
            Some(_) => ReleaseAction::Updated,
        };
        Some(ReleaseNotification {
            action,
            namespace: key.0,
            name: key.1,
            record,
        })
    }

    /// A delete carries the record of the deleted object, or the last one
    /// seen when the object has none.
    fn deleted(&mut self, parts: SecretParts) -> Option<ReleaseNotification> {
        let key = (parts.namespace, parts.name);
        let last = self.known.remove(&key);
        let record = parts.record.or(last)?;
        Some(ReleaseNotification {
            action: ReleaseAction::Deleted,
            namespace: key.0,
            name: key.1,
            record,
        })
    }

    /// Everything known before the relist but not seen during it is gone.
    fn relist_done(&mut self) -> Vec<ReleaseNotification> {
        let Some(seen) = self.relist.take() else {
            return Vec::new();
        };
        let vanished: Vec<SecretKey> = self
            .known
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        let mut out: Vec<ReleaseNotification> = vanished
            .into_iter()
            .filter_map(|key| {
                let record = self.known.remove(&key)?;
                Some(ReleaseNotification {
                    action: ReleaseAction::Deleted,
                    namespace: key.0,
                    name: key.1,
                    record,
                })
            })
            .collect();
        out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        out
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
