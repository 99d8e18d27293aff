//! Configuration system for the `CourtChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courtchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use courtchat_proto::history::DEFAULT_PAGE_SIZE;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting has a value the engine cannot run with.
    #[error("invalid setting {setting}: must be greater than zero")]
    Zero {
        /// Name of the offending setting.
        setting: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    connection: ConnectionFileConfig,
    chat: ChatFileConfig,
    identity: IdentityFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    history_url: Option<String>,
    live_url: Option<String>,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    connect_timeout_secs: Option<u64>,
    keepalive_interval_secs: Option<u64>,
    pong_timeout_secs: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    page_size: Option<u32>,
    optimistic_timeout_secs: Option<u64>,
    reconcile_window_secs: Option<u64>,
    queue_capacity: Option<usize>,
    catch_up_on_reconnect: Option<bool>,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    user_id: Option<i64>,
    user_name: Option<String>,
    conversation: Option<i64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Live-channel lifecycle settings (used by `ConnectionManager`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Upper bound on one connect attempt.
    pub connect_timeout: Duration,
    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,
    /// How long to wait for any frame after a ping before declaring the link dead.
    pub pong_timeout: Duration,
    /// Reconnect attempts after a failure before giving up.
    pub max_reconnect_attempts: u32,
    /// Pause before each reconnect attempt.
    pub reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

/// Conversation behaviour settings (used by `ConversationActor`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Messages per history page.
    pub page_size: u32,
    /// How long an optimistic send may wait for its echo before it is failed.
    pub optimistic_timeout: Duration,
    /// Clock-skew allowance when matching an echo to an optimistic entry.
    pub reconcile_window: Duration,
    /// Capacity of each conversation's command queue.
    pub queue_capacity: usize,
    /// Fetch the newest page again after a reconnection.
    pub catch_up_on_reconnect: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            optimistic_timeout: Duration::from_secs(10),
            reconcile_window: Duration::from_secs(30),
            queue_capacity: 256,
            catch_up_on_reconnect: true,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    // -- Server --
    /// Base URL of the history endpoint (`.../api/messages`).
    pub history_url: Option<String>,
    /// WebSocket URL of the live endpoint (`.../ws/chat`).
    pub live_url: Option<String>,

    // -- Engine --
    /// Connection lifecycle settings.
    pub connection: ConnectionConfig,
    /// Conversation behaviour settings.
    pub chat: ChatConfig,

    // -- Identity --
    /// Authenticated user id.
    pub user_id: Option<i64>,
    /// Display name sent with each message.
    pub user_name: Option<String>,
    /// Conversation to open on start.
    pub conversation: Option<i64>,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/courtchat/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a resolved setting is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or crash the engine.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Zero`] naming the first zero timeout, interval, page
    /// size or queue capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;
        let chat = &self.chat;
        let checks = [
            ("connect_timeout", conn.connect_timeout.is_zero()),
            ("keepalive_interval", conn.keepalive_interval.is_zero()),
            ("pong_timeout", conn.pong_timeout.is_zero()),
            ("page_size", chat.page_size == 0),
            ("optimistic_timeout", chat.optimistic_timeout.is_zero()),
            ("queue_capacity", chat.queue_capacity == 0),
        ];
        match checks.into_iter().find(|(_, zero)| *zero) {
            Some((setting, _)) => Err(ConfigError::Zero { setting }),
            None => Ok(()),
        }
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let conn = ConnectionConfig::default();
        let chat = ChatConfig::default();

        Self {
            history_url: cli
                .history_url
                .clone()
                .or_else(|| file.server.history_url.clone()),
            live_url: cli
                .live_url
                .clone()
                .or_else(|| file.server.live_url.clone()),
            connection: ConnectionConfig {
                connect_timeout: file
                    .connection
                    .connect_timeout_secs
                    .map_or(conn.connect_timeout, Duration::from_secs),
                keepalive_interval: file
                    .connection
                    .keepalive_interval_secs
                    .map_or(conn.keepalive_interval, Duration::from_secs),
                pong_timeout: file
                    .connection
                    .pong_timeout_secs
                    .map_or(conn.pong_timeout, Duration::from_secs),
                max_reconnect_attempts: cli
                    .max_reconnect_attempts
                    .or(file.connection.max_reconnect_attempts)
                    .unwrap_or(conn.max_reconnect_attempts),
                reconnect_delay: file
                    .connection
                    .reconnect_delay_ms
                    .map_or(conn.reconnect_delay, Duration::from_millis),
            },
            chat: ChatConfig {
                page_size: cli
                    .page_size
                    .or(file.chat.page_size)
                    .unwrap_or(chat.page_size),
                optimistic_timeout: file
                    .chat
                    .optimistic_timeout_secs
                    .map_or(chat.optimistic_timeout, Duration::from_secs),
                reconcile_window: file
                    .chat
                    .reconcile_window_secs
                    .map_or(chat.reconcile_window, Duration::from_secs),
                queue_capacity: file.chat.queue_capacity.unwrap_or(chat.queue_capacity),
                catch_up_on_reconnect: file
                    .chat
                    .catch_up_on_reconnect
                    .unwrap_or(chat.catch_up_on_reconnect),
            },
            user_id: cli.user_id.or(file.identity.user_id),
            user_name: cli
                .user_name
                .clone()
                .or_else(|| file.identity.user_name.clone()),
            conversation: cli.conversation.or(file.identity.conversation),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Location chat client")]
pub struct CliArgs {
    /// Base URL of the paged history endpoint.
    #[arg(long, env = "COURTCHAT_HISTORY_URL")]
    pub history_url: Option<String>,

    /// WebSocket URL of the live chat endpoint.
    #[arg(long, env = "COURTCHAT_LIVE_URL")]
    pub live_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "COURTCHAT_USER_ID")]
    pub user_id: Option<i64>,

    /// Your display name.
    #[arg(long, env = "COURTCHAT_USER_NAME")]
    pub user_name: Option<String>,

    /// Conversation (location) id to open.
    #[arg(long)]
    pub conversation: Option<i64>,

    /// Messages per history page.
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Reconnect attempts before the connection is reported failed.
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    /// Path to config file (default: `~/.config/courtchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURTCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/courtchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("courtchat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
