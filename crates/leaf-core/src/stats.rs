//! Live statistics.
//!
//! Counters are plain atomics written by the stream and connection paths and
//! read by [`StatsAggregator::snapshot`] without taking any lock that I/O
//! code holds. Stream counters are updated total-first on open and read
//! active-first, so every reader observes `active_streams <= total_streams`.

use leaf_discovery::NodeSet;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Point-in-time view of the client, as returned by `RelayClient::stats()`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// At least one Session is live
    pub connected: bool,
    /// Live Sessions whose node is in the current snapshot
    pub connected_nodes: u64,
    /// Seconds since `start()`; 0 while stopped
    pub uptime_seconds: u64,
    /// Streams currently open or half-closed
    pub active_streams: u64,
    /// Streams ever opened
    pub total_streams: u64,
    /// Payload bytes written to streams
    pub bytes_sent: u64,
    /// Payload bytes received on streams
    pub bytes_received: u64,
    /// Reconnection attempts
    pub reconnect_count: u64,
    /// Most recent error text from any subsystem
    pub last_error: String,
    /// JSON array of [`ExitPoint`]s
    pub exit_points_json: String,
    /// JSON array of node addresses in the current snapshot
    pub node_addresses_json: String,
}

impl StatsSnapshot {
    /// Serialize as a camelCase JSON object
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Relay-reported view of one live Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitPoint {
    /// Node address
    pub node: String,
    /// Node identifier from discovery
    pub node_id: String,
    /// Identifier reported by the relay
    pub relay_id: String,
    /// Client address as observed by the relay
    pub exit_address: String,
    /// `direct` or the proxy URL without credentials
    pub transport: String,
    /// `connected` or `degraded`
    pub state: String,
    /// Seconds since the Session reached Connected
    pub connected_seconds: u64,
}

/// Shared counters and status for the whole client
#[derive(Debug, Default)]
pub struct StatsAggregator {
    total_streams: AtomicU64,
    active_streams: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    reconnect_count: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    last_error: RwLock<String>,
}

impl StatsAggregator {
    /// Fresh aggregator (all zero, stopped)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A stream was opened
    pub fn stream_opened(&self) {
        self.total_streams.fetch_add(1, Ordering::SeqCst);
        self.active_streams.fetch_add(1, Ordering::SeqCst);
    }

    /// A stream reached Closed
    pub fn stream_closed(&self) {
        let _ = self
            .active_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Payload written to a stream
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Payload received on a stream
    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A Session is being retried
    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrite the last error
    pub fn set_last_error(&self, error: impl Into<String>) {
        *self.last_error.write() = error.into();
    }

    /// Most recent error text (empty if none)
    #[must_use]
    pub fn last_error(&self) -> String {
        self.last_error.read().clone()
    }

    /// Record the start instant
    pub fn mark_started(&self) {
        *self.started_at.lock() = Some(Instant::now());
    }

    /// Forget the start instant
    pub fn mark_stopped(&self) {
        *self.started_at.lock() = None;
    }

    /// Seconds since [`mark_started`](Self::mark_started), 0 while stopped
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at
            .lock()
            .map_or(0, |started| started.elapsed().as_secs())
    }

    /// `(active, total)` stream counts, consistent with each other
    #[must_use]
    pub fn stream_counts(&self) -> (u64, u64) {
        let active = self.active_streams.load(Ordering::SeqCst);
        let total = self.total_streams.load(Ordering::SeqCst);
        (active.min(total), total)
    }

    /// `(sent, received)` byte totals
    #[must_use]
    pub fn byte_counts(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }

    /// Reconnection attempts so far
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    /// Assemble a snapshot
    ///
    /// `exit_points` must already be restricted to live Sessions whose node
    /// is in `nodes`.
    #[must_use]
    pub fn snapshot(&self, exit_points: &[ExitPoint], nodes: &NodeSet) -> StatsSnapshot {
        let (active_streams, total_streams) = self.stream_counts();
        let (bytes_sent, bytes_received) = self.byte_counts();
        let connected_nodes = (exit_points.len() as u64).min(nodes.len() as u64);

        StatsSnapshot {
            connected: connected_nodes > 0,
            connected_nodes,
            uptime_seconds: self.uptime_seconds(),
            active_streams,
            total_streams,
            bytes_sent,
            bytes_received,
            reconnect_count: self.reconnect_count(),
            last_error: self.last_error(),
            exit_points_json: serde_json::to_string(exit_points)
                .unwrap_or_else(|_| "[]".to_string()),
            node_addresses_json: nodes.addresses_json(),
        }
    }
}
