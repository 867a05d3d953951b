//! Server metrics for observability
//!
//! Counters for the HTTP surface and the live event feed. Reactor liveness
//! comes from the registry itself since reactors can end on their own.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Feed metrics
    /// Currently attached `/logs` WebSocket clients
    pub active_feed_connections: AtomicU64,
    /// Total feed connections since server start
    pub total_feed_connections: AtomicU64,
    /// Feed messages written to WebSocket clients
    pub feed_messages_sent: AtomicU64,

    // Pairing metrics
    pub pairings_started: AtomicU64,
    pub pairings_succeeded: AtomicU64,
    pub pairings_failed: AtomicU64,

    // Reactor metrics
    /// Successful `POST /start` calls
    pub reactors_started: AtomicU64,
    /// Successful `POST /stop` calls
    pub reactors_stopped: AtomicU64,
    /// `POST /start` calls rejected or failed
    pub reactor_start_failures: AtomicU64,

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

    // Feed tracking
    pub fn feed_opened(&self) {
        self.active_feed_connections.fetch_add(1, Ordering::Relaxed);
        self.total_feed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn feed_closed(&self) {
        self.active_feed_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn feed_message_sent(&self) {
        self.feed_messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Pairing tracking
    pub fn pairing_started(&self) {
        self.pairings_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pairing_succeeded(&self) {
        self.pairings_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pairing_failed(&self) {
        self.pairings_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Reactor tracking
    pub fn reactor_started(&self) {
        self.reactors_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reactor_stopped(&self) {
        self.reactors_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reactor_start_failed(&self) {
        self.reactor_start_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics.
    ///
    /// `active_reactors` and `observers_dropped` are owned by the registry and
    /// the broadcaster, so the caller supplies them.
    pub fn snapshot(&self, active_reactors: u64, observers_dropped: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            feed: FeedMetrics {
                active: self.active_feed_connections.load(Ordering::Relaxed),
                total: self.total_feed_connections.load(Ordering::Relaxed),
                messages_sent: self.feed_messages_sent.load(Ordering::Relaxed),
                observers_dropped,
            },
            pairings: PairingMetrics {
                started: self.pairings_started.load(Ordering::Relaxed),
                succeeded: self.pairings_succeeded.load(Ordering::Relaxed),
                failed: self.pairings_failed.load(Ordering::Relaxed),
            },
            reactors: ReactorMetrics {
                active: active_reactors,
                started: self.reactors_started.load(Ordering::Relaxed),
                stopped: self.reactors_stopped.load(Ordering::Relaxed),
                start_failures: self.reactor_start_failures.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub feed: FeedMetrics,
    pub pairings: PairingMetrics,
    pub reactors: ReactorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedMetrics {
    pub active: u64,
    pub total: u64,
    pub messages_sent: u64,
    pub observers_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingMetrics {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactorMetrics {
    pub active: u64,
    pub started: u64,
    pub stopped: u64,
    pub start_failures: u64,
}
