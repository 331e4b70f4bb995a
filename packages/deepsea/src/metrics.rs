//! Server metrics for observability
//!
//! Provides runtime metrics for monitoring relay health and throughput.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently registered connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Message metrics
    /// Text messages received from clients
    pub messages_received: AtomicU64,
    /// Chat messages accepted and broadcast
    pub messages_broadcast: AtomicU64,
    /// Individual deliveries queued to recipients
    pub deliveries: AtomicU64,
    /// Payloads that were neither chat, heartbeat nor reset
    pub messages_discarded: AtomicU64,
    /// Deliveries that failed (closed or backpressured recipient)
    pub messages_dropped: AtomicU64,

    // History metrics
    /// Number of history replays to new connections
    pub history_replays: AtomicU64,
    /// Total messages replayed
    pub history_messages_replayed: AtomicU64,
    /// Successful resets
    pub resets: AtomicU64,

    // Heartbeat metrics
    pub heartbeat_probes: AtomicU64,
    pub heartbeat_evictions: AtomicU64,

    // Error metrics
    /// Store append/clear failures
    pub persistence_errors: AtomicU64,
    /// WebSocket transport errors
    pub websocket_errors: AtomicU64,

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

    // Message tracking
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_broadcast(&self, deliveries: usize) {
        self.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(deliveries as u64, Ordering::Relaxed);
    }

    pub fn message_discarded(&self) {
        self.messages_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // History tracking
    pub fn history_replayed(&self, messages: usize) {
        self.history_replays.fetch_add(1, Ordering::Relaxed);
        self.history_messages_replayed
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    pub fn reset_completed(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    // Heartbeat tracking
    pub fn heartbeat_probe(&self) {
        self.heartbeat_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_eviction(&self) {
        self.heartbeat_evictions.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn persistence_error(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                broadcast: self.messages_broadcast.load(Ordering::Relaxed),
                deliveries: self.deliveries.load(Ordering::Relaxed),
                discarded: self.messages_discarded.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            history: HistoryMetrics {
                replays: self.history_replays.load(Ordering::Relaxed),
                messages_replayed: self.history_messages_replayed.load(Ordering::Relaxed),
                resets: self.resets.load(Ordering::Relaxed),
            },
            heartbeat: HeartbeatMetrics {
                probes: self.heartbeat_probes.load(Ordering::Relaxed),
                evictions: self.heartbeat_evictions.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                persistence: self.persistence_errors.load(Ordering::Relaxed),
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub history: HistoryMetrics,
    pub heartbeat: HeartbeatMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub broadcast: u64,
    pub deliveries: u64,
    pub discarded: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMetrics {
    pub replays: u64,
    pub messages_replayed: u64,
    pub resets: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub probes: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub persistence: u64,
    pub websocket: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub history_backend: String,
    pub connections: u64,
    pub uptime_secs: u64,
}
