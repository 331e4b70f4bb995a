use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broadcast::{BroadcastReport, Broadcaster};
use super::connection::{Connection, Outbound};
use super::heartbeat::HeartbeatMonitor;
use super::registry::ConnectionRegistry;
use super::reset::{ResetCoordinator, ResetKey};
use crate::config::{HeartbeatMode, RelayConfig};
use crate::error::RelayError;
use crate::history::History;
use crate::metrics::ServerMetrics;

/// Sent to the originating connection only when its message could not be
/// processed.
pub const ERROR_NOTICE: &str = "❌ Server error: unable to process message";

/// What an inbound payload turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    HeartbeatReply,
    ResetCommand,
    Chat,
    Discard,
}

/// Decides whether a payload counts as a chat message.
#[derive(Clone, Debug, Default)]
pub struct ChatPredicate {
    delimiter: Option<String>,
}

impl ChatPredicate {
    pub fn new(delimiter: Option<String>) -> Self {
        Self { delimiter }
    }

    pub fn matches(&self, payload: &str) -> bool {
        if payload.trim().is_empty() {
            return false;
        }
        match &self.delimiter {
            Some(d) => payload.contains(d.as_str()),
            None => true,
        }
    }
}

/// Classify `payload`; the first matching rule wins.
pub fn classify(
    payload: &str,
    heartbeat: &HeartbeatMonitor,
    key: &ResetKey,
    chat: &ChatPredicate,
) -> Classification {
    if heartbeat.is_reply(payload) {
        Classification::HeartbeatReply
    } else if key.is_presented_in(payload) {
        Classification::ResetCommand
    } else if chat.matches(payload) {
        Classification::Chat
    } else {
        Classification::Discard
    }
}

/// The relay core: one instance per process, shared by every connection
/// task and the heartbeat task.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    history: Arc<History>,
    broadcaster: Arc<Broadcaster>,
    heartbeat: Arc<HeartbeatMonitor>,
    reset: ResetCoordinator,
    chat: ChatPredicate,
    metrics: Arc<ServerMetrics>,
}

impl Relay {
    pub fn new(config: RelayConfig, history: Arc<History>, metrics: Arc<ServerMetrics>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), metrics.clone()));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            config.heartbeat_mode,
            config.heartbeat_interval,
            metrics.clone(),
        ));
        let reset = ResetCoordinator::new(history.clone(), broadcaster.clone(), metrics.clone());
        let chat = ChatPredicate::new(config.chat_delimiter.clone());

        Self {
            config,
            registry,
            history,
            broadcaster,
            heartbeat,
            reset,
            chat,
            metrics,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub async fn current_key(&self) -> ResetKey {
        self.reset.current_key().await
    }

    /// Open a new connection: queue the history replay, then register it.
    ///
    /// Both happen under the history lock, so every chat message reaches the
    /// new connection exactly once, through either the replay or a live
    /// broadcast.
    pub async fn connect(&self) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let history = self.history.lock().await;
        let backlog = history.snapshot();

        // Room for the whole replay on top of the regular queue depth
        let capacity = self.config.send_channel_capacity.saturating_add(backlog.len());
        let (conn, rx) = Connection::new(self.registry.next_id(), capacity);

        for message in &backlog {
            if let Err(e) = conn.send(message.as_str()) {
                warn!(conn_id = %conn.id(), "History replay interrupted: {}", e);
                break;
            }
        }
        self.registry.register(conn.clone()).await;
        drop(history);

        self.metrics.history_replayed(backlog.len());
        info!(
            conn_id = %conn.id(),
            "🎉 New client connected ({} replayed, {} active)",
            backlog.len(),
            self.registry.len().await
        );

        (conn, rx)
    }

    /// Handle one inbound text payload from `conn`.
    pub async fn handle_text(&self, conn: &Connection, payload: &str) -> Classification {
        self.metrics.message_received();

        let key = self.reset.current_key().await;
        let class = classify(payload, &self.heartbeat, &key, &self.chat);

        match class {
            Classification::HeartbeatReply => self.heartbeat.record_pong(conn).await,
            Classification::ResetCommand => {
                warn!(conn_id = %conn.id(), "Reset requested");
                if self.reset.reset_if_current(&key).await.is_err() {
                    self.notify_error(conn);
                }
            }
            Classification::Chat => {
                debug!(conn_id = %conn.id(), "📩 {}", payload);
                if let Err(e) = self.relay_chat(payload).await {
                    error!(conn_id = %conn.id(), "Failed to relay message: {}", e);
                    self.metrics.persistence_error();
                    self.notify_error(conn);
                }
            }
            Classification::Discard => {
                debug!(conn_id = %conn.id(), "Discarding non-chat payload: {:?}", payload);
                self.metrics.message_discarded();
            }
        }

        class
    }

    /// Record a control-frame pong from `conn`.
    pub async fn handle_pong(&self, conn: &Connection) {
        match self.heartbeat.mode() {
            HeartbeatMode::ControlFrame => self.heartbeat.record_pong(conn).await,
            HeartbeatMode::Application => {
                debug!(conn_id = %conn.id(), "Ignoring control pong in application mode");
            }
        }
    }

    /// Persist, then broadcast. Nothing is broadcast if the store rejects
    /// the message.
    async fn relay_chat(&self, payload: &str) -> Result<BroadcastReport, RelayError> {
        let mut history = self.history.lock().await;
        history.append(payload).await?;
        Ok(self.broadcaster.broadcast(payload).await)
    }

    fn notify_error(&self, conn: &Connection) {
        if let Err(e) = conn.send(ERROR_NOTICE) {
            debug!(conn_id = %conn.id(), "Error notice not delivered: {}", e);
        }
    }

    /// Remove `conn` after its transport closed or failed. Idempotent.
    pub async fn disconnect(&self, conn: &Connection) {
        if self.registry.close(conn).await {
            let connected_for = chrono::Utc::now() - conn.connected_at();
            info!(
                conn_id = %conn.id(),
                "😢 Client disconnected after {}s ({} active)",
                connected_for.num_seconds(),
                self.registry.len().await
            );
        }
    }

    pub fn spawn_heartbeat(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.heartbeat.clone().spawn(cancel)
    }

    /// Close every connection and release the history store.
    pub async fn shutdown(&self) {
        let closed = self.registry.close_all().await;
        info!("Closed {} connections", closed);
        self.history.store().close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::test_support::FlakyStore;
    use crate::history::{HistoryStore, MemoryHistoryStore};
    use crate::relay::heartbeat::{PING_TOKEN, PONG_TOKEN};
    use crate::relay::reset::HISTORY_CLEARED_NOTICE;
    use crate::relay::ConnectionState;
    use std::time::Duration;

    async fn relay_with(store: Arc<dyn HistoryStore>, config: RelayConfig) -> Relay {
        let history = Arc::new(History::bootstrap(store, config.history_limit).await);
        Relay::new(config, history, Arc::new(ServerMetrics::new()))
    }

    async fn relay() -> Relay {
        relay_with(Arc::new(MemoryHistoryStore::new()), RelayConfig::default()).await
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn text(s: &str) -> Outbound {
        Outbound::Text(s.to_string())
    }

    #[test]
    fn chat_predicate_requires_delimiter() {
        let chat = ChatPredicate::new(Some(":".into()));
        assert!(chat.matches("alice: hi"));
        assert!(!chat.matches("hello"));
        assert!(!chat.matches("   "));

        let any = ChatPredicate::new(None);
        assert!(any.matches("hello"));
        assert!(!any.matches(""));
    }

    #[tokio::test]
    async fn classification_order() {
        let relay = relay_with(
            Arc::new(MemoryHistoryStore::new()),
            RelayConfig {
                heartbeat_mode: HeartbeatMode::Application,
                ..RelayConfig::default()
            },
        )
        .await;
        let key = relay.current_key().await;
        let class_of = |p: &str| classify(p, &relay.heartbeat, &key, &relay.chat);

        assert_eq!(class_of(PONG_TOKEN), Classification::HeartbeatReply);
        // Contains the delimiter too, but the key wins
        assert_eq!(
            class_of(&format!("admin: {}", key)),
            Classification::ResetCommand
        );
        assert_eq!(class_of("alice: hi"), Classification::Chat);
        assert_eq!(class_of("no delimiter"), Classification::Discard);
    }

    #[tokio::test]
    async fn empty_history_replays_nothing() {
        let relay = relay().await;
        let (_conn, mut rx) = relay.connect().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn chat_is_broadcast_and_replayed_to_late_joiners() {
        let relay = relay().await;
        let (a, mut rx_a) = relay.connect().await;
        let (_b, mut rx_b) = relay.connect().await;

        let class = relay.handle_text(&a, "alice: hi").await;
        assert_eq!(class, Classification::Chat);
        assert_eq!(drain(&mut rx_b), vec![text("alice: hi")]);
        // The sender hears its own message too
        assert_eq!(drain(&mut rx_a), vec![text("alice: hi")]);

        let (_c, mut rx_c) = relay.connect().await;
        assert_eq!(drain(&mut rx_c), vec![text("alice: hi")]);
    }

    #[tokio::test]
    async fn replay_is_chronological_and_bounded() {
        let relay = relay_with(
            Arc::new(MemoryHistoryStore::new()),
            RelayConfig {
                history_limit: 2,
                ..RelayConfig::default()
            },
        )
        .await;
        let (a, _rx_a) = relay.connect().await;
        for m in ["a: 1", "a: 2", "a: 3"] {
            relay.handle_text(&a, m).await;
        }

        let (_late, mut rx) = relay.connect().await;
        assert_eq!(drain(&mut rx), vec![text("a: 2"), text("a: 3")]);
    }

    #[tokio::test]
    async fn replay_larger_than_queue_is_not_truncated() {
        let relay = relay_with(
            Arc::new(MemoryHistoryStore::new()),
            RelayConfig {
                send_channel_capacity: 1,
                ..RelayConfig::default()
            },
        )
        .await;
        let (a, mut rx_a) = relay.connect().await;
        for i in 0..5 {
            relay.handle_text(&a, &format!("a: {}", i)).await;
            drain(&mut rx_a);
        }

        let (_late, mut rx) = relay.connect().await;
        assert_eq!(drain(&mut rx).len(), 5);
    }

    #[tokio::test]
    async fn reset_key_clears_and_notifies_everyone() {
        let store = Arc::new(MemoryHistoryStore::new());
        let relay = relay_with(store.clone(), RelayConfig::default()).await;
        let (a, mut rx_a) = relay.connect().await;
        let (_b, mut rx_b) = relay.connect().await;
        relay.handle_text(&a, "alice: hi").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let before = relay.current_key().await;
        let class = relay
            .handle_text(&a, &format!("please reset {} thanks", before))
            .await;

        assert_eq!(class, Classification::ResetCommand);
        assert_ne!(relay.current_key().await, before);
        assert!(store.load(100).await.unwrap().is_empty());
        assert_eq!(drain(&mut rx_a), vec![text(HISTORY_CLEARED_NOTICE)]);
        assert_eq!(drain(&mut rx_b), vec![text(HISTORY_CLEARED_NOTICE)]);

        // The reset command itself is never stored or replayed
        let (_c, mut rx_c) = relay.connect().await;
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn failed_persist_is_not_broadcast() {
        let store = Arc::new(FlakyStore::default());
        let relay = relay_with(store.clone(), RelayConfig::default()).await;
        let (a, mut rx_a) = relay.connect().await;
        let (_b, mut rx_b) = relay.connect().await;
        store.set_fail_append(true);

        relay.handle_text(&a, "alice: lost").await;

        assert_eq!(drain(&mut rx_a), vec![text(ERROR_NOTICE)]);
        assert!(drain(&mut rx_b).is_empty());
        assert!(a.is_open());
        assert_eq!(relay.metrics().snapshot().errors.persistence, 1);

        // Subsequent messages go through once the store recovers
        store.set_fail_append(false);
        relay.handle_text(&a, "alice: back").await;
        assert_eq!(drain(&mut rx_b), vec![text("alice: back")]);
    }

    #[tokio::test]
    async fn failed_reset_notifies_only_sender() {
        let store = Arc::new(FlakyStore::default());
        let relay = relay_with(store.clone(), RelayConfig::default()).await;
        let (a, mut rx_a) = relay.connect().await;
        let (_b, mut rx_b) = relay.connect().await;
        store.set_fail_clear(true);

        let key = relay.current_key().await;
        relay.handle_text(&a, key.as_str()).await;

        assert_eq!(relay.current_key().await, key);
        assert_eq!(drain(&mut rx_a), vec![text(ERROR_NOTICE)]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn discarded_payload_goes_nowhere() {
        let relay = relay().await;
        let (a, mut rx_a) = relay.connect().await;
        let (_b, mut rx_b) = relay.connect().await;

        assert_eq!(relay.handle_text(&a, "no delimiter").await, Classification::Discard);
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert!(relay.history().snapshot().await.is_empty());
        assert_eq!(relay.metrics().snapshot().messages.discarded, 1);
    }

    #[tokio::test]
    async fn application_pong_is_not_relayed() {
        let relay = relay_with(
            Arc::new(MemoryHistoryStore::new()),
            RelayConfig {
                heartbeat_mode: HeartbeatMode::Application,
                ..RelayConfig::default()
            },
        )
        .await;
        let (a, mut rx_a) = relay.connect().await;

        relay.heartbeat().sweep().await;
        assert_eq!(drain(&mut rx_a), vec![text(PING_TOKEN)]);

        relay.handle_text(&a, PONG_TOKEN).await;
        assert!(drain(&mut rx_a).is_empty());
        assert!(relay.history().snapshot().await.is_empty());

        // Answered, so the next sweep probes instead of evicting
        let report = relay.heartbeat().sweep().await;
        assert!(report.evicted.is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let relay = relay().await;
        let (a, _rx) = relay.connect().await;

        relay.disconnect(&a).await;
        relay.disconnect(&a).await;
        assert_eq!(a.state(), ConnectionState::Closed);
        assert!(relay.registry().is_empty().await);
        assert_eq!(relay.metrics().snapshot().connections.active, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_racing_chat_leaves_consistent_history() {
        let store = Arc::new(MemoryHistoryStore::new());
        let relay = Arc::new(relay_with(store.clone(), RelayConfig::default()).await);
        let (sender, _rx_sender) = relay.connect().await;
        let (_observer, mut rx) = relay.connect().await;
        let key = relay.current_key().await;

        let mut tasks = Vec::new();
        for i in 0..80 {
            if i == 40 {
                let (relay, sender, key) = (relay.clone(), sender.clone(), key.clone());
                tasks.push(tokio::spawn(async move {
                    relay.handle_text(&sender, key.as_str()).await
                }));
            }
            let (relay, sender) = (relay.clone(), sender.clone());
            tasks.push(tokio::spawn(async move {
                relay.handle_text(&sender, &format!("a: {}", i)).await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let frames: Vec<String> = drain(&mut rx)
            .into_iter()
            .map(|frame| match frame {
                Outbound::Text(t) => t,
                Outbound::Ping => panic!("unexpected ping"),
            })
            .collect();
        assert_eq!(frames.len(), 81);
        let notice = frames
            .iter()
            .position(|f| f == HISTORY_CLEARED_NOTICE)
            .unwrap();

        // Exactly the messages broadcast after the notice survive, in order
        let stored = store.load(1000).await.unwrap();
        assert_eq!(stored, frames[notice + 1..].to_vec());
        assert_eq!(relay.history().snapshot().await, stored);
        assert_ne!(relay.current_key().await, key);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_evicted_after_two_intervals() {
        let relay = relay().await;
        let (silent, mut rx_silent) = relay.connect().await;
        let (_other, mut rx_other) = relay.connect().await;
        let cancel = CancellationToken::new();
        let heartbeat = relay.spawn_heartbeat(cancel.clone());

        let interval = relay.config().heartbeat_interval;
        tokio::time::sleep(interval * 2 + Duration::from_secs(1)).await;

        assert!(!relay.registry().contains(silent.id()).await);
        assert_ne!(silent.state(), ConnectionState::Open);
        assert_eq!(drain(&mut rx_silent), vec![Outbound::Ping]);
        drain(&mut rx_other);

        let report = relay.broadcaster.broadcast("after: eviction").await;
        assert_eq!(report.delivered, 0);
        assert!(report.failed.is_empty());
        assert!(drain(&mut rx_silent).is_empty());

        cancel.cancel();
        heartbeat.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_everyone() {
        let relay = relay().await;
        let (a, _rx_a) = relay.connect().await;
        let (b, _rx_b) = relay.connect().await;

        relay.shutdown().await;
        assert!(relay.registry().is_empty().await);
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
    }
}
