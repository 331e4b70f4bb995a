//! WebSocket Handler
//!
//! Bridges one upgraded socket to the relay core.

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::relay::{Outbound, Relay};

/// How long to wait for the close frame to go out before dropping the socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a relay WebSocket connection until either side closes it.
pub async fn handle_relay_ws(socket: WebSocket, relay: Arc<Relay>) {
    let (conn, mut rx) = relay.connect().await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task to send queued frames to the WebSocket
    let writer_conn = conn.clone();
    let sender_task = async move {
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => frame,
                _ = writer_conn.closed() => {
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "connection closed by relay".into(),
                    }));
                    if tokio::time::timeout(CLOSE_TIMEOUT, ws_sender.send(close))
                        .await
                        .is_err()
                    {
                        debug!(conn_id = %writer_conn.id(), "Close frame timed out");
                    }
                    break;
                }
            };
            let Some(frame) = frame else { break };
            let msg = match frame {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Ping => Message::Ping(Bytes::new()),
            };

            // A peer that stopped reading can stall this send forever
            tokio::select! {
                result = ws_sender.send(msg) => {
                    if result.is_err() {
                        break;
                    }
                }
                _ = writer_conn.closed() => {
                    debug!(conn_id = %writer_conn.id(), "Dropping stalled socket");
                    break;
                }
            }
        }
    };

    // Task to handle incoming messages, one at a time
    let reader_conn = conn.clone();
    let reader_relay = relay.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    reader_relay.handle_text(&reader_conn, text.as_str()).await;
                }
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        reader_relay.handle_text(&reader_conn, text).await;
                    }
                    Err(_) => {
                        debug!(conn_id = %reader_conn.id(), "Discarding non-UTF-8 binary frame");
                        reader_relay.metrics().message_discarded();
                    }
                },
                Ok(Message::Pong(_)) => reader_relay.handle_pong(&reader_conn).await,
                // axum answers pings itself
                Ok(Message::Ping(_)) => {}
                Ok(Message::Close(_)) => {
                    debug!(conn_id = %reader_conn.id(), "Client closed connection");
                    break;
                }
                Err(e) => {
                    error!(conn_id = %reader_conn.id(), "WebSocket error: {}", e);
                    reader_relay.metrics().websocket_error();
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id = %conn.id(), "Sender task ended"),
        _ = input_task => debug!(conn_id = %conn.id(), "Input task ended"),
    }

    relay.disconnect(&conn).await;
}
