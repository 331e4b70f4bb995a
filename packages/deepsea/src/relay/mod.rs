//! Relay Core
//!
//! Connection lifecycle and broadcast fan-out:
//! - `ConnectionRegistry` owns the set of live connections
//! - `HeartbeatMonitor` probes them on a timer and evicts silent peers
//! - `Broadcaster` delivers one message to every open connection
//! - `ResetCoordinator` clears history and rotates the reset key
//! - `Relay` classifies inbound payloads and routes them to the above
//!
//! Lock order is history, then key, then registry.

mod broadcast;
mod connection;
mod heartbeat;
mod registry;
mod reset;
mod service;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use connection::{Connection, ConnectionId, ConnectionState, Outbound};
pub use heartbeat::{HeartbeatMonitor, PING_TOKEN, PONG_TOKEN, SweepReport};
pub use registry::ConnectionRegistry;
pub use reset::{HISTORY_CLEARED_NOTICE, ResetCoordinator, ResetKey};
pub use service::{ChatPredicate, Classification, ERROR_NOTICE, Relay, classify};
