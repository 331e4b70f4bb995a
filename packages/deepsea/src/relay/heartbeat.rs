use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionId, Liveness, Outbound};
use super::registry::ConnectionRegistry;
use crate::config::HeartbeatMode;
use crate::metrics::ServerMetrics;

/// Server → client probe in application mode.
pub const PING_TOKEN: &str = r#"{"type":"PING"}"#;
/// Client → server reply in application mode.
pub const PONG_TOKEN: &str = r#"{"type":"PONG"}"#;

/// Result of one sweep over the registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Periodic arm-then-check liveness sweeps.
///
/// Each sweep evicts connections that never answered the previous probe and
/// probes the rest, so a silent peer is gone within two intervals.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    mode: HeartbeatMode,
    interval: Duration,
    metrics: Arc<ServerMetrics>,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        mode: HeartbeatMode,
        interval: Duration,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            registry,
            mode,
            interval,
            metrics,
        }
    }

    pub fn mode(&self) -> HeartbeatMode {
        self.mode
    }

    fn probe_frame(&self) -> Outbound {
        match self.mode {
            HeartbeatMode::ControlFrame => Outbound::Ping,
            HeartbeatMode::Application => Outbound::Text(PING_TOKEN.to_string()),
        }
    }

    /// Whether `payload` is the heartbeat reply for the configured framing.
    pub fn is_reply(&self, payload: &str) -> bool {
        self.mode == HeartbeatMode::Application && payload.trim() == PONG_TOKEN
    }

    /// Record a reply from `conn`.
    pub async fn record_pong(&self, conn: &Connection) {
        conn.mark_alive().await;
        debug!(conn_id = %conn.id(), "Heartbeat reply");
    }

    /// Run one sweep over every registered connection.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for conn in self.registry.snapshot().await {
            if !conn.is_open() {
                continue;
            }

            match conn.arm_probe().await {
                Liveness::AwaitingPong { probed_at } => {
                    warn!(
                        conn_id = %conn.id(),
                        "🛑 Terminating unresponsive client (probed {:?} ago, last seen {:?} ago)",
                        probed_at.elapsed(),
                        conn.last_seen().await.elapsed()
                    );
                    self.registry.close(&conn).await;
                    self.metrics.heartbeat_eviction();
                    report.evicted.push(conn.id());
                }
                Liveness::Alive => {
                    // A failed probe leaves the connection armed; the next sweep evicts it
                    if let Err(e) = conn.push(self.probe_frame()) {
                        debug!(conn_id = %conn.id(), "Heartbeat probe not queued: {}", e);
                    }
                    self.metrics.heartbeat_probe();
                    report.probed += 1;
                }
            }
        }

        report
    }

    /// Sweep every `interval` until `cancel` fires. The first sweep happens
    /// one full interval after start.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Heartbeat monitor started ({:?} every {:?})",
                self.mode, self.interval
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Heartbeat monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep().await;
                        if !report.evicted.is_empty() {
                            info!(
                                "Heartbeat sweep: probed {}, evicted {}",
                                report.probed,
                                report.evicted.len()
                            );
                        }
                    }
                }
            }
        })
    }
}
