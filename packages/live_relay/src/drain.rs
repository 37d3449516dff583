//! Progress reporting for node drains.

use serde::Serialize;
use tracing::debug;

use crate::envelope::{Envelope, names};
use crate::error::RelayError;
use crate::hub::HubHandle;

/// Payload of a `drain_{node}_{uid}` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainProgress<'a> {
    pub pod: &'a str,
    pub ns: &'a str,
    /// `true` if the pod went through the eviction API, `false` if it was
    /// deleted directly.
    pub eviction: bool,
}

/// Publishes one envelope per pod removed from a node being drained.
#[derive(Clone)]
pub struct DrainReporter {
    hub: HubHandle,
    event: String,
}

impl DrainReporter {
    pub fn new(hub: HubHandle, node: &str, node_uid: &str) -> Self {
        Self {
            hub,
            event: names::drain_progress(node, node_uid),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn pod_evicted(&self, pod: &str, namespace: &str, eviction: bool) -> Result<(), RelayError> {
        debug!(event = %self.event, pod, namespace, eviction, "pod removed from node");
        let envelope = Envelope::new(
            self.event.clone(),
            DrainProgress {
                pod,
                ns: namespace,
                eviction,
            },
        )?;
        self.hub.publish(&envelope)
    }
}
