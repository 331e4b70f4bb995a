use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [relay]
//                    history_limit = 500
//
//   env var:         DEEPSEA_RELAY__HISTORY_LIMIT=500   (double underscore = nesting)
//
//   CLI flag:        --port 4000   (server section only)

/// How liveness probes are framed on the wire.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatMode {
    /// Native WebSocket ping/pong control frames.
    #[default]
    ControlFrame,
    /// `{"type":"PING"}` / `{"type":"PONG"}` text messages.
    Application,
}

/// Which history backend to open at startup.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Sqlite,
    File,
    Memory,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub history: HistoryFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Relay core tunables (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub heartbeat_mode: HeartbeatMode,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// A payload must contain this to count as a chat message.
    /// Empty accepts any non-blank payload.
    #[serde(default = "default_chat_delimiter")]
    pub chat_delimiter: String,
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_mode: HeartbeatMode::default(),
            history_limit: default_history_limit(),
            chat_delimiter: default_chat_delimiter(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// History backend selection (lives under `[history]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryFileConfig {
    #[serde(default)]
    pub backend: HistoryBackend,
    /// Overrides the backend's default file inside the data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3008
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_history_limit() -> usize {
    100
}
fn default_chat_delimiter() -> String {
    ":".to_string()
}
fn default_send_channel_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → config.toml → DEEPSEA_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `DEEPSEA_SERVER__PORT=4000`  →  `server.port = 4000`
///   `DEEPSEA_HISTORY__BACKEND=file`  →  `history.backend = "file"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("DEEPSEA_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Relay core configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Time between heartbeat sweeps
    pub heartbeat_interval: Duration,
    pub heartbeat_mode: HeartbeatMode,
    /// Maximum messages replayed to a newly connected client
    pub history_limit: usize,
    /// `None` accepts any non-blank payload as chat
    pub chat_delimiter: Option<String>,
    /// Outbound queue depth per connection before sends are rejected
    pub send_channel_capacity: usize,
}

/// Upper bound on the per-connection outbound queue depth.
pub const MAX_SEND_CHANNEL_CAPACITY: usize = 65_536;
/// Upper bound on the replay window.
pub const MAX_HISTORY_LIMIT: usize = 100_000;

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        Self {
            // A zero interval would make tokio's interval panic
            heartbeat_interval: Duration::from_secs(fc.heartbeat_interval_secs.max(1)),
            heartbeat_mode: fc.heartbeat_mode,
            history_limit: fc.history_limit.min(MAX_HISTORY_LIMIT),
            chat_delimiter: if fc.chat_delimiter.is_empty() {
                None
            } else {
                Some(fc.chat_delimiter.clone())
            },
            send_channel_capacity: fc
                .send_channel_capacity
                .clamp(1, MAX_SEND_CHANNEL_CAPACITY),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(&RelayFileConfig::default())
    }
}

// =============================================================================
// Directory layout config (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DeepSeaConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub history_file_path: PathBuf,
}

impl DeepSeaConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory (pass --data-dir)")?
                .join(".deepsea"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("deepsea.db");
        let history_file_path = data_dir.join("chat_history.json");

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
            history_file_path,
        })
    }

    /// Apply a `[history] path` override to whichever backend is selected.
    pub fn with_history_override(mut self, history: &HistoryFileConfig) -> Self {
        if let Some(path) = &history.path {
            match history.backend {
                HistoryBackend::Sqlite => self.db_path = path.clone(),
                HistoryBackend::File => self.history_file_path = path.clone(),
                HistoryBackend::Memory => {}
            }
        }
        self
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
