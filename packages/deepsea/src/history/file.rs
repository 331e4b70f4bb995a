use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::HistoryStore;
use crate::error::HistoryError;

/// History kept as a pretty-printed JSON array of strings.
///
/// The whole file is rewritten on every append, via a temp file and rename
/// so a crash never leaves a truncated array behind.
pub struct FileHistoryStore {
    path: PathBuf,
    cache: Mutex<Cached>,
}

#[derive(Default)]
struct Cached {
    messages: Vec<String>,
    loaded: bool,
}

impl FileHistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new(Cached::default()),
        }
    }

    /// Where an unparseable history file is moved before a fresh one is
    /// started.
    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    /// Read the whole file. Contents that do not parse are moved to
    /// [`corrupt_path`](Self::corrupt_path) before the error is returned, so
    /// the next write cannot overwrite them.
    async fn read_file(&self) -> Result<Vec<String>, HistoryError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&data) {
            Ok(messages) => Ok(messages),
            Err(e) => {
                let aside = self.corrupt_path();
                tokio::fs::rename(&self.path, &aside).await?;
                warn!(
                    "Unreadable history file moved to {}: {}",
                    aside.display(),
                    e
                );
                Err(e.into())
            }
        }
    }

    async fn write_file(&self, messages: &[String]) -> Result<(), HistoryError> {
        let json = serde_json::to_string_pretty(messages)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote {} messages to {}", messages.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self, limit: usize) -> Result<Vec<String>, HistoryError> {
        let mut cache = self.cache.lock().await;
        match self.read_file().await {
            Ok(messages) => cache.messages = messages,
            Err(e) => {
                // The bad file is already out of the way; start over empty
                if matches!(e, HistoryError::Serialization(_)) {
                    cache.messages.clear();
                    cache.loaded = true;
                }
                return Err(e);
            }
        }
        cache.loaded = true;
        let start = cache.messages.len().saturating_sub(limit);
        Ok(cache.messages[start..].to_vec())
    }

    async fn append(&self, message: &str) -> Result<(), HistoryError> {
        let mut cache = self.cache.lock().await;
        if !cache.loaded {
            // Never rewrite a file that could not be read
            cache.messages = match self.read_file().await {
                Ok(messages) => messages,
                Err(HistoryError::Serialization(_)) => Vec::new(),
                Err(e) => return Err(e),
            };
            cache.loaded = true;
        }
        cache.messages.push(message.to_string());
        if let Err(e) = self.write_file(&cache.messages).await {
            cache.messages.pop();
            return Err(e);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), HistoryError> {
        let mut cache = self.cache.lock().await;
        self.write_file(&[]).await?;
        cache.messages.clear();
        cache.loaded = true;
        Ok(())
    }

    async fn ping(&self) -> Result<(), HistoryError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                tokio::fs::metadata(dir).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
