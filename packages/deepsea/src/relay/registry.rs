use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::connection::{Connection, ConnectionId};
use crate::metrics::ServerMetrics;

/// The authoritative set of live connections.
///
/// Iteration works on a snapshot taken under the read lock, so visitors
/// never hold the lock and concurrent register/unregister calls are safe.
/// Each visit sees a connection at most once.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    metrics: Arc<ServerMetrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Allocate an id for a connection about to be registered.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub async fn register(&self, conn: Arc<Connection>) {
        let id = conn.id();
        let previous = self.connections.write().await.insert(id, conn);
        if previous.is_none() {
            self.metrics.connection_opened();
        }
        debug!(conn_id = %id, "Registered connection");
    }

    pub async fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() {
            self.metrics.connection_closed();
            debug!(conn_id = %id, "Unregistered connection");
        }
        removed
    }

    #[cfg(test)]
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Current members, in no particular order.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Visit every member registered at the time of the call.
    pub async fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for conn in self.snapshot().await {
            visit(&conn);
        }
    }

    /// Signal the transport, drop the connection from the set and mark it
    /// closed. Safe to call any number of times; returns whether this call
    /// was the one that closed it.
    pub async fn close(&self, conn: &Connection) -> bool {
        let initiated = conn.begin_close();
        self.unregister(conn.id()).await;
        conn.mark_closed();
        initiated
    }

    /// Close every registered connection. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for conn in self.snapshot().await {
            if self.close(&conn).await {
                closed += 1;
            }
        }
        closed
    }
}
