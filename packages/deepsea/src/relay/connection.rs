use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// Unique identifier for a relay connection
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frames queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Control-frame liveness probe
    Ping,
}

/// Lifecycle of a registered connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Heartbeat state. A connection still `AwaitingPong` when the next sweep
/// runs is evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Liveness {
    Alive,
    AwaitingPong { probed_at: Instant },
}

#[derive(Debug)]
struct LivenessRecord {
    state: Liveness,
    last_seen: Instant,
}

/// Handle to one live transport session.
///
/// The transport side owns the receiving half of the outbound queue and
/// watches [`Connection::closed`] to know when to tear the socket down.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,
    liveness: Mutex<LivenessRecord>,
    outbound: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection in the `Open` state with an outbound queue of
    /// `capacity` frames.
    pub fn new(id: ConnectionId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id,
            state: AtomicU8::new(ConnectionState::Open as u8),
            liveness: Mutex::new(LivenessRecord {
                state: Liveness::Alive,
                last_seen: Instant::now(),
            }),
            outbound: tx,
            shutdown: CancellationToken::new(),
            connected_at: Utc::now(),
        };
        (Arc::new(conn), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queue a text message without waiting. Fails if the connection is no
    /// longer open or its queue is full.
    pub fn send(&self, text: impl Into<String>) -> Result<(), RelayError> {
        self.push(Outbound::Text(text.into()))
    }

    pub(crate) fn push(&self, frame: Outbound) -> Result<(), RelayError> {
        if !self.is_open() {
            return Err(RelayError::ConnectionClosed(self.id));
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::Backpressure(self.id),
            mpsc::error::TrySendError::Closed(_) => RelayError::ConnectionClosed(self.id),
        })
    }

    #[cfg(test)]
    pub(crate) async fn liveness(&self) -> Liveness {
        self.liveness.lock().await.state
    }

    pub(crate) async fn last_seen(&self) -> Instant {
        self.liveness.lock().await.last_seen
    }

    /// Advance the heartbeat state by one sweep and return the state it was
    /// in before. `Alive` becomes `AwaitingPong`; `AwaitingPong` is left as is
    /// for the caller to evict.
    pub(crate) async fn arm_probe(&self) -> Liveness {
        let mut record = self.liveness.lock().await;
        let previous = record.state;
        if previous == Liveness::Alive {
            record.state = Liveness::AwaitingPong {
                probed_at: Instant::now(),
            };
        }
        previous
    }

    /// Record a heartbeat reply.
    pub(crate) async fn mark_alive(&self) {
        let mut record = self.liveness.lock().await;
        record.state = Liveness::Alive;
        record.last_seen = Instant::now();
    }

    /// Move `Open` to `Closing` and signal the transport. Returns `false` if
    /// the connection was already closing or closed.
    pub(crate) fn begin_close(&self) -> bool {
        let initiated = self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        self.shutdown.cancel();
        initiated
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Resolves once the connection has been asked to close.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}
