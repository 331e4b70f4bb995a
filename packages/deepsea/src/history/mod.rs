//! Message History
//!
//! `HistoryStore` is the durable log behind the relay, with SQLite, JSON-file
//! and in-memory backends. `History` keeps the bounded replay window in memory
//! and serializes append, clear and snapshot behind a single lock so that a
//! reset can never interleave with a half-appended message.

mod file;
mod memory;
mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::config::{DeepSeaConfig, HistoryBackend};
use crate::db::Database;
use crate::error::HistoryError;

pub use file::FileHistoryStore;
pub use memory::MemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;

/// Durable append-only log of relayed messages.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// The most recent `limit` messages, oldest first.
    async fn load(&self, limit: usize) -> Result<Vec<String>, HistoryError>;

    async fn append(&self, message: &str) -> Result<(), HistoryError>;

    async fn clear(&self) -> Result<(), HistoryError>;

    /// Cheap reachability check used by the readiness probe.
    async fn ping(&self) -> Result<(), HistoryError> {
        Ok(())
    }

    /// Release the underlying handle on shutdown.
    async fn close(&self) {}
}

/// Open the configured backend. Failure here is fatal to startup.
pub async fn open_store(
    config: &DeepSeaConfig,
    backend: HistoryBackend,
) -> Result<Arc<dyn HistoryStore>> {
    let store: Arc<dyn HistoryStore> = match backend {
        HistoryBackend::Sqlite => {
            let db = Database::new(config).await?;
            Arc::new(SqliteHistoryStore::new(db.pool))
        }
        HistoryBackend::File => Arc::new(FileHistoryStore::new(config.history_file_path.clone())),
        HistoryBackend::Memory => Arc::new(MemoryHistoryStore::new()),
    };
    info!("History backend: {}", store.name());
    Ok(store)
}

/// In-memory replay window backed by a [`HistoryStore`].
pub struct History {
    store: Arc<dyn HistoryStore>,
    limit: usize,
    entries: Mutex<VecDeque<String>>,
}

impl History {
    /// Load the replay window from `store`. An unreachable store degrades to
    /// an empty history instead of failing.
    pub async fn bootstrap(store: Arc<dyn HistoryStore>, limit: usize) -> Self {
        let entries = match store.load(limit).await {
            Ok(messages) => {
                info!("Loaded {} history messages from {}", messages.len(), store.name());
                messages.into()
            }
            Err(e) => {
                warn!(
                    "Failed to load history from {}, starting empty: {}",
                    store.name(),
                    e
                );
                VecDeque::new()
            }
        };

        Self {
            store,
            limit,
            entries: Mutex::new(entries),
        }
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Take exclusive access to the history. Everything done through the
    /// guard is atomic with respect to other holders.
    pub async fn lock(&self) -> HistoryGuard<'_> {
        HistoryGuard {
            history: self,
            entries: self.entries.lock().await,
        }
    }

    /// Convenience for callers that only need a copy.
    pub async fn snapshot(&self) -> Vec<String> {
        self.lock().await.snapshot()
    }
}

pub struct HistoryGuard<'a> {
    history: &'a History,
    entries: MutexGuard<'a, VecDeque<String>>,
}

impl HistoryGuard<'_> {
    /// Chronological copy of the replay window.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    /// Persist `message`, then add it to the replay window. Nothing is
    /// recorded in memory if the store rejects it.
    pub async fn append(&mut self, message: &str) -> Result<(), HistoryError> {
        self.history.store.append(message).await?;

        if self.history.limit == 0 {
            return Ok(());
        }
        self.entries.push_back(message.to_string());
        while self.entries.len() > self.history.limit {
            self.entries.pop_front();
        }
        Ok(())
    }

    /// Clear the store and rebuild the replay window from it. The in-memory
    /// window is left untouched when the clear itself fails.
    pub async fn clear(&mut self) -> Result<(), HistoryError> {
        self.history.store.clear().await?;

        let reloaded = match self.history.store.load(self.history.limit).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to reload history after clear: {}", e);
                Vec::new()
            }
        };
        *self.entries = reloaded.into();
        Ok(())
    }
}
