//! Wire message pushed to every dashboard client.
//!
//! Every push is a JSON object `{"event": <name>, "payload": <any>}`. The
//! dashboard subscribes by event name, so the names built in [`names`] are a
//! compatibility contract and must not change shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable `{event, payload}` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    event: String,
    payload: Value,
}

impl Envelope {
    /// Build an envelope from any serializable payload.
    pub fn new(event: impl Into<String>, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Build an envelope around an already-materialized JSON value.
    pub fn from_value(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Serialize to the text frame sent over the socket.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Release store change kinds, as they appear in event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseAction {
    Added,
    Updated,
    Deleted,
}

impl ReleaseAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseAction::Added => "added",
            ReleaseAction::Updated => "updated",
            ReleaseAction::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ReleaseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-name grammar shared with the dashboard.
pub mod names {
    use super::ReleaseAction;

    /// `{kind}-{cluster}-updated`
    pub fn resource_updated(kind: &str, cluster: &str) -> String {
        format!("{kind}-{cluster}-updated")
    }

    /// `{kind}-{cluster}-deleted`
    pub fn resource_deleted(kind: &str, cluster: &str) -> String {
        format!("{kind}-{cluster}-deleted")
    }

    /// `{uid}-{cluster}-updated`
    pub fn object_events_updated(uid: &str, cluster: &str) -> String {
        format!("{uid}-{cluster}-updated")
    }

    /// `drain_{node}_{uid}`
    pub fn drain_progress(node: &str, node_uid: &str) -> String {
        format!("drain_{node}_{node_uid}")
    }

    /// `pod_log_line_{pod}_{namespace}`
    pub fn pod_log_line(pod: &str, namespace: &str) -> String {
        format!("pod_log_line_{pod}_{namespace}")
    }

    /// `helm-release-{cluster}-{added|updated|deleted}`
    pub fn helm_release(cluster: &str, action: ReleaseAction) -> String {
        format!("helm-release-{cluster}-{action}")
    }
}
