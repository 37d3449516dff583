//! Node drain driver
//!
//! Cordon, pick the pods to remove with the usual kubectl rules, evict them
//! (deleting when the eviction API is unavailable) and wait for each one to
//! disappear before reporting it.

use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Client;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use live_relay::RelayError;
use live_relay::cluster::DrainRequest;
use live_relay::drain::DrainReporter;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";
/// Pause before retrying an eviction refused by a disruption budget.
const EVICTION_RETRY: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What the drain does with one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Remove,
    Skip(&'static str),
    /// The pod blocks the drain.
    Reject(&'static str),
}

fn controller_kind(pod: &Pod) -> Option<&str> {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller == Some(true))
        .map(|owner| owner.kind.as_str())
}

fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn is_mirror(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_ANNOTATION))
}

fn has_empty_dir(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|v| v.empty_dir.is_some()))
}

/// Filters applied in order; the first one that does not allow removal
/// decides.
pub fn classify(pod: &Pod, request: &DrainRequest) -> Disposition {
    let finished = is_finished(pod);
    let controller = controller_kind(pod);

    if controller == Some("DaemonSet") && !finished {
        return if request.ignore_daemon_sets {
            Disposition::Skip("managed by a DaemonSet")
        } else {
            Disposition::Reject("cannot delete DaemonSet-managed Pods")
        };
    }
    if is_mirror(pod) {
        return Disposition::Skip("mirror pod");
    }
    if has_empty_dir(pod) && !finished && !request.delete_empty_dir_data {
        return Disposition::Reject("cannot delete Pods with local storage");
    }
    if controller.is_none() && !finished && !request.force {
        return Disposition::Reject("cannot delete Pods that declare no controller");
    }
    Disposition::Remove
}

fn pod_name(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Pods to remove, or an error naming every pod that blocks the drain.
pub fn plan(pods: Vec<Pod>, request: &DrainRequest) -> Result<Vec<Pod>, RelayError> {
    let mut remove = Vec::new();
    let mut blocked: Vec<(&'static str, String)> = Vec::new();
    for pod in pods {
        match classify(&pod, request) {
            Disposition::Remove => remove.push(pod),
            Disposition::Skip(reason) => debug!(pod = %pod_name(&pod), reason, "skipping pod"),
            Disposition::Reject(reason) => blocked.push((reason, pod_name(&pod))),
        }
    }
    if blocked.is_empty() {
        return Ok(remove);
    }

    blocked.sort();
    let mut message = String::new();
    for group in blocked.chunk_by(|a, b| a.0 == b.0) {
        let names: Vec<&str> = group.iter().map(|(_, name)| name.as_str()).collect();
        if !message.is_empty() {
            message.push_str("; ");
        }
        message.push_str(&format!("{}: {}", group[0].0, names.join(", ")));
    }
    Err(RelayError::api(message))
}

/// Cordon `request.node`, remove its pods and report each one through
/// `reporter` once it is gone.
pub async fn drain_node(
    client: Client,
    request: &DrainRequest,
    reporter: &DrainReporter,
) -> Result<(), RelayError> {
    let deadline =
        (request.timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(request.timeout_secs));

    let nodes: Api<Node> = Api::all(client.clone());
    let cordon = json!({ "spec": { "unschedulable": true } });
    nodes
        .patch(&request.node, &PatchParams::default(), &Patch::Merge(&cordon))
        .await
        .map_err(RelayError::api)?;
    info!(node = %request.node, "node cordoned");

    let pods: Api<Pod> = Api::all(client.clone());
    let on_node = pods
        .list(&ListParams::default().fields(&format!("spec.nodeName={}", request.node)))
        .await
        .map_err(RelayError::api)?;
    let targets = plan(on_node.items, request)?;
    info!(node = %request.node, pods = targets.len(), "draining node");

    let mut removed = Vec::with_capacity(targets.len());
    for pod in targets {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let eviction = remove_pod(&api, &name, deadline).await?;
        removed.push((api, namespace, name, pod.metadata.uid, eviction));
    }

    for (api, namespace, name, uid, eviction) in removed {
        wait_for_delete(&api, &name, uid.as_deref(), deadline).await?;
        reporter.pod_evicted(&name, &namespace, eviction)?;
    }
    info!(node = %request.node, "node drained");
    Ok(())
}

fn timed_out(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn drain_timeout(deadline: Option<Instant>, started: Instant) -> RelayError {
    RelayError::Timeout {
        operation: "drain node",
        after: deadline.map(|d| d - started).unwrap_or_default(),
    }
}

/// Evict `name`, retrying while a disruption budget refuses it. Falls back
/// to a plain delete when the eviction API is not served. Returns whether
/// eviction was used.
async fn remove_pod(api: &Api<Pod>, name: &str, deadline: Option<Instant>) -> Result<bool, RelayError> {
    let started = Instant::now();
    loop {
        match api.evict(name, &EvictParams::default()).await {
            Ok(_) => return Ok(true),
            // Already gone.
            Err(kube::Error::Api(status)) if status.code == 404 => return Ok(true),
            Err(kube::Error::Api(status)) if status.code == 429 => {
                warn!(pod = name, "eviction refused by disruption budget, retrying");
                if timed_out(deadline) {
                    return Err(drain_timeout(deadline, started));
                }
                tokio::time::sleep(EVICTION_RETRY).await;
            }
            Err(kube::Error::Api(status)) if status.code == 405 || status.code == 501 => {
                debug!(pod = name, "eviction not available, deleting");
                return match api.delete(name, &DeleteParams::default()).await {
                    Ok(_) => Ok(false),
                    Err(kube::Error::Api(status)) if status.code == 404 => Ok(false),
                    Err(err) => Err(RelayError::api(err)),
                };
            }
            Err(err) => return Err(RelayError::api(err)),
        }
    }
}

/// Poll until the pod is gone or replaced by one with another uid.
async fn wait_for_delete(
    api: &Api<Pod>,
    name: &str,
    uid: Option<&str>,
    deadline: Option<Instant>,
) -> Result<(), RelayError> {
    let started = Instant::now();
    loop {
        match api.get_opt(name).await.map_err(RelayError::api)? {
            None => return Ok(()),
            Some(current) if current.metadata.uid.as_deref() != uid => return Ok(()),
            Some(_) => {}
        }
        if timed_out(deadline) {
            return Err(drain_timeout(deadline, started));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
