//! Broadcast Hub
//!
//! A single control loop owns the set of connected clients. Registration,
//! unregistration and publishing are all messages to that loop, so they are
//! linearized without any lock: an envelope published before a client's
//! registration completes is never delivered to it, and one published after
//! always is.
//!
//! Each client gets its own bounded outbound queue. The loop only ever uses
//! `try_send`, so a client that stops reading cannot stall delivery to
//! anyone else; what happens to it on overflow is an [`OverflowPolicy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::RelayError;

/// Identifier handed out on registration.
pub type ClientId = u64;

/// Serialized envelope as it goes over the wire.
pub type Frame = Arc<str>;

/// What the hub does when a client's outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the client. Its queue is closed and the socket task ends, so the
    /// dashboard reconnects and refetches instead of silently missing events.
    #[default]
    Disconnect,
    /// Keep the client and discard the envelope that did not fit.
    DropNewest,
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Per-client outbound queue capacity (clamped to at least 1).
    pub client_queue: usize,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue: 256,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Counters kept by the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub clients: u64,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}

enum HubCommand {
    Register {
        id: ClientId,
        tx: mpsc::Sender<Frame>,
        respond_to: oneshot::Sender<()>,
    },
    Unregister {
        id: ClientId,
    },
    Publish {
        event: String,
        frame: Frame,
    },
    Stats {
        respond_to: oneshot::Sender<HubStats>,
    },
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    next_id: Arc<AtomicU64>,
    client_queue: usize,
}

/// A registered client's end of its outbound queue.
///
/// `recv` yields `None` once the client has been unregistered, evicted, or
/// the hub has shut down.
pub struct Subscription {
    id: ClientId,
    rx: mpsc::Receiver<Frame>,
}

impl Subscription {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

/// Start the control loop. It runs until `shutdown` is cancelled or every
/// [`HubHandle`] has been dropped.
pub fn spawn(config: HubConfig, shutdown: CancellationToken) -> (HubHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = HubHandle {
        commands: tx,
        next_id: Arc::new(AtomicU64::new(1)),
        client_queue: config.client_queue.max(1),
    };
    let task = tokio::spawn(run(rx, config.overflow, shutdown));
    (handle, task)
}

impl HubHandle {
    /// Add a client. Returns once the control loop has taken ownership of
    /// the client's queue, so every later `publish` reaches it.
    pub async fn register(&self) -> Result<Subscription, RelayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.client_queue);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Register {
                id,
                tx,
                respond_to: ack_tx,
            })
            .map_err(|_| RelayError::HubClosed)?;
        ack_rx.await.map_err(|_| RelayError::HubClosed)?;
        Ok(Subscription { id, rx })
    }

    /// Remove a client. Unknown ids are ignored.
    pub fn unregister(&self, id: ClientId) {
        let _ = self.commands.send(HubCommand::Unregister { id });
    }

    /// Queue an envelope for every currently registered client.
    ///
    /// Never waits on clients: the envelope is serialized here, on the
    /// caller's task, and handed to the loop over an unbounded channel.
    pub fn publish(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let frame: Frame = envelope.to_json()?.into();
        self.commands
            .send(HubCommand::Publish {
                event: envelope.event().to_string(),
                frame,
            })
            .map_err(|_| RelayError::HubClosed)
    }

    pub async fn stats(&self) -> Result<HubStats, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Stats { respond_to: tx })
            .map_err(|_| RelayError::HubClosed)?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Whether the control loop is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<HubCommand>,
    overflow: OverflowPolicy,
    shutdown: CancellationToken,
) {
    let mut clients: HashMap<ClientId, mpsc::Sender<Frame>> = HashMap::new();
    let mut stats = HubStats::default();
    info!(?overflow, "broadcast hub started");

    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            HubCommand::Register { id, tx, respond_to } => {
                clients.insert(id, tx);
                debug!(client = id, clients = clients.len(), "client registered");
                let _ = respond_to.send(());
            }
            HubCommand::Unregister { id } => {
                if clients.remove(&id).is_some() {
                    debug!(client = id, clients = clients.len(), "client unregistered");
                }
            }
            HubCommand::Publish { event, frame } => {
                stats.published += 1;
                clients.retain(|id, tx| match tx.try_send(frame.clone()) {
                    Ok(()) => {
                        stats.delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => match overflow {
                        OverflowPolicy::DropNewest => {
                            stats.dropped += 1;
                            warn!(client = *id, event = %event, "client queue full, envelope dropped");
                            true
                        }
                        OverflowPolicy::Disconnect => {
                            stats.evicted += 1;
                            warn!(client = *id, event = %event, "client queue full, disconnecting");
                            false
                        }
                    },
                    Err(TrySendError::Closed(_)) => {
                        debug!(client = *id, "client queue closed, removing");
                        false
                    }
                });
            }
            HubCommand::Stats { respond_to } => {
                stats.clients = clients.len() as u64;
                let _ = respond_to.send(stats);
            }
        }
    }

    info!(clients = clients.len(), "broadcast hub stopped");
}
