use std::sync::Arc;
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionId};
use super::registry::ConnectionRegistry;
use crate::metrics::ServerMetrics;

/// Outcome of one broadcast pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the message was queued for
    pub delivered: usize,
    /// Recipients whose send failed; they have been closed and unregistered
    pub failed: Vec<ConnectionId>,
}

/// Fan-out of one message to every open connection.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ServerMetrics>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<ServerMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Queue `message` for every connection that is open when the pass
    /// reaches it. A failing recipient never stops the pass; it is removed
    /// once the pass is over.
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let mut delivered = 0;
        let mut failing: Vec<Arc<Connection>> = Vec::new();

        self.registry
            .for_each(|conn| {
                if !conn.is_open() {
                    return;
                }
                match conn.send(message) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(conn_id = %conn.id(), "Broadcast send failed: {}", e);
                        failing.push(conn.clone());
                    }
                }
            })
            .await;

        let mut failed = Vec::with_capacity(failing.len());
        for conn in failing {
            self.metrics.message_dropped();
            self.registry.close(&conn).await;
            failed.push(conn.id());
        }

        self.metrics.message_broadcast(delivered);
        debug!(
            "Broadcast to {} recipients ({} failed)",
            delivered,
            failed.len()
        );

        BroadcastReport { delivered, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{ConnectionState, Outbound};
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        broadcaster: Broadcaster,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(ServerMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let broadcaster = Broadcaster::new(registry.clone(), metrics);
        Fixture {
            registry,
            broadcaster,
        }
    }

    async fn join(
        registry: &ConnectionRegistry,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = Connection::new(registry.next_id(), capacity);
        registry.register(conn.clone()).await;
        (conn, rx)
    }

    #[tokio::test]
    async fn delivers_to_every_open_connection() {
        let f = fixture();
        let (_a, mut rx_a) = join(&f.registry, 4).await;
        let (_b, mut rx_b) = join(&f.registry, 4).await;

        let report = f.broadcaster.broadcast("alice: hi").await;
        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Text("alice: hi".into()));
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Text("alice: hi".into()));
    }

    #[tokio::test]
    async fn failing_recipient_does_not_block_others() {
        let f = fixture();
        let (dead, rx_dead) = join(&f.registry, 4).await;
        drop(rx_dead);
        let (_ok, mut rx_ok) = join(&f.registry, 4).await;

        let report = f.broadcaster.broadcast("bob: yo").await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![dead.id()]);
        assert_eq!(rx_ok.try_recv().unwrap(), Outbound::Text("bob: yo".into()));

        // The failing connection was scheduled for removal
        assert!(!f.registry.contains(dead.id()).await);
        assert_eq!(dead.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn backpressured_recipient_is_removed() {
        let f = fixture();
        let (slow, _rx_slow) = join(&f.registry, 1).await;

        assert_eq!(f.broadcaster.broadcast("one: 1").await.delivered, 1);
        let report = f.broadcaster.broadcast("two: 2").await;
        assert_eq!(report.failed, vec![slow.id()]);
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn skips_connections_that_are_not_open() {
        let f = fixture();
        let (closing, mut rx_closing) = join(&f.registry, 4).await;
        // Closing but not yet unregistered, as during an eviction race
        closing.begin_close();

        let report = f.broadcaster.broadcast("carol: hey").await;
        assert_eq!(report.delivered, 0);
        assert!(report.failed.is_empty());
        assert!(rx_closing.try_recv().is_err());
    }

    #[tokio::test]
    async fn sends_twice_when_called_twice() {
        let f = fixture();
        let (_a, mut rx) = join(&f.registry, 4).await;
        f.broadcaster.broadcast("dup: x").await;
        f.broadcaster.broadcast("dup: x").await;
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("dup: x".into()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("dup: x".into()));
    }

    #[tokio::test]
    async fn late_joiner_misses_earlier_broadcast() {
        let f = fixture();
        let (_a, mut rx_a) = join(&f.registry, 4).await;
        f.broadcaster.broadcast("early: 1").await;
        let (_b, mut rx_b) = join(&f.registry, 4).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_connections_receive_under_concurrent_churn() {
        let f = fixture();
        let registry = f.registry.clone();
        let (_steady, mut rx_steady) = join(&registry, 64).await;

        let churn = tokio::spawn(async move {
            for _ in 0..50 {
                let (c, _rx) = Connection::new(registry.next_id(), 1);
                registry.register(c.clone()).await;
                registry.close(&c).await;
            }
        });

        for i in 0..20 {
            f.broadcaster.broadcast(&format!("n: {}", i)).await;
        }
        churn.await.unwrap();

        // The connection that stayed open throughout got every message
        for i in 0..20 {
            assert_eq!(
                rx_steady.try_recv().unwrap(),
                Outbound::Text(format!("n: {}", i))
            );
        }
    }
}
