//! Live event multiplexing for the dashboard backend.
//!
//! Long-lived sources (resource watches, log tails, the release store) are
//! turned into `{event, payload}` envelopes and fanned out through one
//! [`hub`] to every connected client. Listeners are deduplicated by key in
//! the [`registry`]; the cluster itself is reached only through
//! [`cluster::ClusterApi`].

pub mod cluster;
pub mod drain;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod log_stream;
pub mod registry;
pub mod release;
pub mod resource_watch;
pub mod utf8;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cluster::ClusterApi;
pub use envelope::Envelope;
pub use error::RelayError;
pub use hub::{HubConfig, HubHandle, OverflowPolicy};
pub use registry::{StartOutcome, WatcherRegistry};
