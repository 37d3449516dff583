//! Server metrics for observability
//!
//! Counters are bumped by the handlers and the websocket loop; the hub keeps
//! its own delivery stats, which are folded into the snapshot on request.

use live_relay::hub::HubStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open websocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Watch metrics
    /// Watches that opened a new stream
    pub watches_started: AtomicU64,
    /// Watch requests that joined an existing stream
    pub watches_deduplicated: AtomicU64,
    /// Watch requests that failed to open
    pub watch_failures: AtomicU64,

    // Log metrics
    pub log_streams_started: AtomicU64,
    pub log_streams_stopped: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Watch tracking
    pub fn watch_started(&self, started: bool) {
        if started {
            self.watches_started.fetch_add(1, Ordering::Relaxed);
        } else {
            self.watches_deduplicated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn watch_failed(&self) {
        self.watch_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Log tracking
    pub fn log_stream_started(&self) {
        self.log_streams_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_stream_stopped(&self) {
        self.log_streams_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics. `hub` is `None` once the hub loop
    /// has stopped.
    pub fn snapshot(&self, hub: Option<HubStats>, active_watchers: usize) -> MetricsSnapshot {
        let hub = hub.unwrap_or_default();
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            watches: WatchMetrics {
                active: active_watchers as u64,
                started: self.watches_started.load(Ordering::Relaxed),
                deduplicated: self.watches_deduplicated.load(Ordering::Relaxed),
                failed: self.watch_failures.load(Ordering::Relaxed),
            },
            logs: LogMetrics {
                started: self.log_streams_started.load(Ordering::Relaxed),
                stopped: self.log_streams_stopped.load(Ordering::Relaxed),
            },
            hub: HubMetrics {
                clients: hub.clients,
                published: hub.published,
                delivered: hub.delivered,
                dropped: hub.dropped,
                evicted: hub.evicted,
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub watches: WatchMetrics,
    pub logs: LogMetrics,
    pub hub: HubMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchMetrics {
    /// Listeners currently held by the registry (watches and log tails)
    pub active: u64,
    pub started: u64,
    pub deduplicated: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetrics {
    pub started: u64,
    pub stopped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubMetrics {
    pub clients: u64,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}
