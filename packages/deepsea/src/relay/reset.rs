use rand::Rng;
use rand::distr::Alphanumeric;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::broadcast::Broadcaster;
use crate::error::HistoryError;
use crate::history::{History, HistoryGuard};
use crate::metrics::ServerMetrics;

/// Notice broadcast to every client after a reset.
pub const HISTORY_CLEARED_NOTICE: &str = "🧹 Chat history has been cleared";

const RESET_KEY_LEN: usize = 32;

/// The secret whose presence in a message triggers a reset.
#[derive(Clone, PartialEq, Eq)]
pub struct ResetKey(String);

impl ResetKey {
    pub fn generate() -> Self {
        let key = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(RESET_KEY_LEN)
            .map(char::from)
            .collect();
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `payload` presents this key anywhere in its text.
    pub fn is_presented_in(&self, payload: &str) -> bool {
        payload.contains(self.0.as_str())
    }
}

impl std::fmt::Display for ResetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Keep the secret out of `{:?}` output
impl std::fmt::Debug for ResetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResetKey(..)")
    }
}

/// Owns the reset key and performs clear + rekey + notify as one unit.
pub struct ResetCoordinator {
    key: RwLock<ResetKey>,
    history: Arc<History>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<ServerMetrics>,
}

impl ResetCoordinator {
    pub fn new(
        history: Arc<History>,
        broadcaster: Arc<Broadcaster>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            key: RwLock::new(ResetKey::generate()),
            history,
            broadcaster,
            metrics,
        }
    }

    /// A full copy of the key currently in effect.
    pub async fn current_key(&self) -> ResetKey {
        self.key.read().await.clone()
    }

    /// Clear the history, rotate the key, and tell every client.
    ///
    /// Runs under the history lock, so no chat message can be appended or
    /// replayed halfway through. If the store refuses to clear, the key is
    /// kept and the error returned.
    pub async fn reset(&self) -> Result<ResetKey, HistoryError> {
        let mut history = self.history.lock().await;
        self.reset_locked(&mut history).await
    }

    /// Like [`reset`](Self::reset), but only if `presented` is still the key
    /// in effect once the history lock is held. Returns `Ok(None)` when a
    /// concurrent reset already retired it.
    pub async fn reset_if_current(
        &self,
        presented: &ResetKey,
    ) -> Result<Option<ResetKey>, HistoryError> {
        let mut history = self.history.lock().await;
        if *self.key.read().await != *presented {
            info!("Ignoring stale reset key");
            return Ok(None);
        }
        self.reset_locked(&mut history).await.map(Some)
    }

    async fn reset_locked(
        &self,
        history: &mut HistoryGuard<'_>,
    ) -> Result<ResetKey, HistoryError> {
        if let Err(e) = history.clear().await {
            error!("Reset failed, key not rotated: {}", e);
            self.metrics.persistence_error();
            return Err(e);
        }

        let new_key = ResetKey::generate();
        *self.key.write().await = new_key.clone();
        warn!("🔑 History cleared; new reset key: {}", new_key);

        let report = self.broadcaster.broadcast(HISTORY_CLEARED_NOTICE).await;
        self.metrics.reset_completed();
        info!("Reset notice sent to {} clients", report.delivered);
        Ok(new_key)
    }
}
