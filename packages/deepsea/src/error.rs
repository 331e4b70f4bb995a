//! Error types for the relay core and its history backends.

use crate::relay::ConnectionId;

/// Failures raised by a [`HistoryStore`](crate::history::HistoryStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("history file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("history store unavailable: {0}")]
    Unavailable(String),
}

/// Failures surfaced while relaying a message.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("{0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("{0} outbound queue is full")]
    Backpressure(ConnectionId),
}
