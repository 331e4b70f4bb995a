//! Relay WebSocket Transport
//!
//! One task pair per client socket:
//! - a writer draining the connection's outbound queue onto the socket
//! - a reader feeding inbound frames to the relay in arrival order

mod handler;

pub use handler::handle_relay_ws;
