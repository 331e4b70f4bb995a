use async_trait::async_trait;
use tokio::sync::Mutex;

use super::HistoryStore;
use crate::error::HistoryError;

/// Process-local history; everything is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    messages: Mutex<Vec<String>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, limit: usize) -> Result<Vec<String>, HistoryError> {
        let messages = self.messages.lock().await;
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }

    async fn append(&self, message: &str) -> Result<(), HistoryError> {
        self.messages.lock().await.push(message.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<(), HistoryError> {
        self.messages.lock().await.clear();
        Ok(())
    }
}
