//! Watcher Registry
//!
//! Key-addressed table of live background listeners. At most one listener
//! exists per key: `start_if_absent` reserves the key under the lock before
//! anything is opened, so concurrent requests for the same key collapse onto
//! one start. The open itself runs outside the lock so a slow control plane
//! never blocks unrelated keys.
//!
//! Every entry carries a generation number. A listener that ends removes its
//! entry only if the generation still matches, so a listener that was
//! stopped and replaced can never evict its replacement.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    /// Key reserved, stream being opened.
    Starting,
    Active,
    /// Stop signalled, listener not yet exited.
    Stopping,
    Terminated,
}

/// What a `start_if_absent` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Another listener already owns the key (possibly still starting).
    AlreadyRunning,
}

impl StartOutcome {
    pub fn started(self) -> bool {
        matches!(self, StartOutcome::Started)
    }
}

/// The running half of a watcher, returned by a successful start function.
pub type Listener = BoxFuture<'static, ()>;

struct Slot {
    generation: u64,
    stop: CancellationToken,
    state: Arc<watch::Sender<WatcherState>>,
}

struct Inner {
    table: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
}

/// A key held in `Starting` while its source is opened. Unless disarmed, the
/// key is freed when the guard drops.
struct Reservation {
    registry: WatcherRegistry,
    key: String,
    generation: u64,
    state: Arc<watch::Sender<WatcherState>>,
    armed: bool,
}

impl Reservation {
    fn disarm(mut self) {
        self.armed = false;
    }

    async fn release(mut self) {
        self.armed = false;
        self.registry.remove_if_current(&self.key, self.generation).await;
        self.state.send_replace(WatcherState::Terminated);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.state.send_replace(WatcherState::Terminated);
        debug!(key = %self.key, generation = self.generation, "start abandoned");
        if let Ok(mut table) = self.registry.inner.table.try_lock() {
            if table.get(&self.key).is_some_and(|slot| slot.generation == self.generation) {
                table.remove(&self.key);
            }
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.registry.clone();
        let key = std::mem::take(&mut self.key);
        let generation = self.generation;
        runtime.spawn(async move {
            registry.remove_if_current(&key, generation).await;
        });
    }
}

#[derive(Clone)]
pub struct WatcherRegistry {
    inner: Arc<Inner>,
}

/// Observer for a watcher that was asked to stop.
pub struct WatcherStatus {
    state: watch::Receiver<WatcherState>,
}

impl WatcherStatus {
    pub fn current(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Resolves once the listener task has exited.
    pub async fn terminated(mut self) {
        // A closed channel means the listener never ran or already finished.
        let _ = self
            .state
            .wait_for(|state| *state == WatcherState::Terminated)
            .await;
    }
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Start a listener for `key` unless one already exists.
    ///
    /// `start` receives the stop token and opens the source; it returns the
    /// listener future, which is spawned once it is ready. If `start` fails
    /// the key is released and the error is returned to the caller.
    pub async fn start_if_absent<F, Fut>(
        &self,
        key: &str,
        start: F,
    ) -> Result<StartOutcome, RelayError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Listener, RelayError>>,
    {
        let stop = CancellationToken::new();
        let state = Arc::new(watch::Sender::new(WatcherState::Starting));
        let generation = {
            let mut table = self.inner.table.lock().await;
            if table.contains_key(key) {
                debug!(key, "watcher already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            table.insert(
                key.to_string(),
                Slot {
                    generation,
                    stop: stop.clone(),
                    state: state.clone(),
                },
            );
            generation
        };

        // Dropping this call mid-open releases the key through the guard.
        let reservation = Reservation {
            registry: self.clone(),
            key: key.to_string(),
            generation,
            state: state.clone(),
            armed: true,
        };
        let listener = match start(stop).await {
            Ok(listener) => listener,
            Err(err) => {
                reservation.release().await;
                return Err(err);
            }
        };
        reservation.disarm();

        state.send_if_modified(|current| {
            if *current == WatcherState::Starting {
                *current = WatcherState::Active;
                true
            } else {
                false
            }
        });
        info!(key, generation, "watcher started");

        let registry = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            listener.await;
            registry.remove_if_terminal(&key, generation).await;
            state.send_replace(WatcherState::Terminated);
        });

        Ok(StartOutcome::Started)
    }

    /// Signal the listener for `key` to stop and forget it. Absent keys are
    /// a no-op and return `None`.
    pub async fn stop(&self, key: &str) -> Option<WatcherStatus> {
        let slot = self.inner.table.lock().await.remove(key)?;
        slot.state.send_if_modified(|current| {
            if *current == WatcherState::Terminated {
                false
            } else {
                *current = WatcherState::Stopping;
                true
            }
        });
        slot.stop.cancel();
        info!(key, generation = slot.generation, "watcher stopped");
        Some(WatcherStatus {
            state: slot.state.subscribe(),
        })
    }

    /// Self-unregistration for a listener that reached its terminal state.
    /// Returns whether the entry was removed; a newer generation under the
    /// same key is left alone.
    pub async fn remove_if_terminal(&self, key: &str, generation: u64) -> bool {
        let removed = self.remove_if_current(key, generation).await;
        if removed {
            info!(key, generation, "watcher terminated");
        }
        removed
    }

    async fn remove_if_current(&self, key: &str, generation: u64) -> bool {
        let mut table = self.inner.table.lock().await;
        match table.get(key) {
            Some(slot) if slot.generation == generation => {
                table.remove(key);
                true
            }
            _ => false,
        }
    }

    pub async fn state(&self, key: &str) -> Option<WatcherState> {
        let table = self.inner.table.lock().await;
        table.get(key).map(|slot| *slot.state.borrow())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.table.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Keys of every live entry, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.table.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stop everything. Used at shutdown.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(String, Slot)> = self.inner.table.lock().await.drain().collect();
        for (key, slot) in &drained {
            slot.state.send_replace(WatcherState::Stopping);
            slot.stop.cancel();
            debug!(key = %key, "watcher stopped at shutdown");
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    /// A listener that runs until stopped.
    fn until_stopped(stop: CancellationToken) -> Listener {
        async move { stop.cancelled().await }.boxed()
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_listener() {
        let registry = WatcherRegistry::new();
        let opens = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            let opens = opens.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .start_if_absent("Pod-c1", |stop| async move {
                        opens.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(until_stopped(stop))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut started = 0;
        for task in tasks {
            if task.await.unwrap().started() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_while_starting_returns_immediately() {
        let registry = WatcherRegistry::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .start_if_absent("k", |stop| async move {
                        let _ = release_rx.await;
                        Ok(until_stopped(stop))
                    })
                    .await
            })
        };

        // Wait for the first start to reserve the key.
        timeout(Duration::from_secs(1), async {
            while !registry.contains("k").await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.state("k").await, Some(WatcherState::Starting));

        let second = registry
            .start_if_absent("k", |_| async { Err(RelayError::api("opened twice")) })
            .await
            .unwrap();
        assert_eq!(second, StartOutcome::AlreadyRunning);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), StartOutcome::Started);
        assert_eq!(registry.state("k").await, Some(WatcherState::Active));
    }

    #[tokio::test]
    async fn stop_then_start_opens_a_new_listener() {
        let registry = WatcherRegistry::new();
        let opens = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let opens = opens.clone();
            let outcome = registry
                .start_if_absent("k", |stop| async move {
                    opens.fetch_add(1, Ordering::SeqCst);
                    Ok(until_stopped(stop))
                })
                .await
                .unwrap();
            assert!(outcome.started());

            let status = registry.stop("k").await.expect("was running");
            timeout(Duration::from_secs(1), status.terminated())
                .await
                .unwrap();
        }
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn stop_of_unknown_key_is_a_no_op() {
        let registry = WatcherRegistry::new();
        assert!(registry.stop("missing").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn listener_end_frees_the_key() {
        let registry = WatcherRegistry::new();
        let (end_tx, end_rx) = oneshot::channel::<()>();
        registry
            .start_if_absent("k", |_| async move {
                Ok(async move {
                    let _ = end_rx.await;
                }
                .boxed())
            })
            .await
            .unwrap();
        assert!(registry.contains("k").await);

        end_tx.send(()).unwrap();
        timeout(Duration::from_secs(1), async {
            while registry.contains("k").await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let again = registry
            .start_if_absent("k", |stop| async move { Ok(until_stopped(stop)) })
            .await
            .unwrap();
        assert!(again.started());
    }

    #[tokio::test]
    async fn failed_start_releases_the_key() {
        let registry = WatcherRegistry::new();
        let err = registry
            .start_if_absent("k", |_| async { Err(RelayError::api("forbidden")) })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Api(_)));
        assert!(!registry.contains("k").await);

        let outcome = registry
            .start_if_absent("k", |stop| async move { Ok(until_stopped(stop)) })
            .await
            .unwrap();
        assert!(outcome.started());
    }

    #[tokio::test]
    async fn abandoned_start_releases_the_key() {
        let registry = WatcherRegistry::new();
        let pending = timeout(
            Duration::from_millis(20),
            registry.start_if_absent("k", |stop| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(until_stopped(stop))
            }),
        )
        .await;
        assert!(pending.is_err());

        timeout(Duration::from_secs(1), async {
            while registry.contains("k").await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let outcome = registry
            .start_if_absent("k", |stop| async move { Ok(until_stopped(stop)) })
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::Started);
        assert_eq!(registry.state("k").await, Some(WatcherState::Active));
    }

    #[tokio::test]
    async fn stopped_listener_cannot_evict_its_replacement() {
        let registry = WatcherRegistry::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // First listener ignores its stop token and only ends when released.
        registry
            .start_if_absent("k", |_| async move {
                Ok(async move {
                    let _ = release_rx.await;
                }
                .boxed())
            })
            .await
            .unwrap();
        let old = registry.stop("k").await.unwrap();
        assert_eq!(old.current(), WatcherState::Stopping);

        registry
            .start_if_absent("k", |stop| async move { Ok(until_stopped(stop)) })
            .await
            .unwrap();

        release_tx.send(()).unwrap();
        timeout(Duration::from_secs(1), old.terminated())
            .await
            .unwrap();

        assert_eq!(registry.state("k").await, Some(WatcherState::Active));
    }

    #[tokio::test]
    async fn stop_all_cancels_everything() {
        let registry = WatcherRegistry::new();
        for key in ["a", "b", "c"] {
            registry
                .start_if_absent(key, |stop| async move { Ok(until_stopped(stop)) })
                .await
                .unwrap();
        }
        assert_eq!(registry.keys().await, vec!["a", "b", "c"]);
        assert_eq!(registry.stop_all().await, 3);
        assert!(registry.is_empty().await);
    }
}
