//! Server settings.
//!
//! A value given on the command line (or its environment variable) beats
//! the TOML file, which beats the built-in default. The file is read from
//! `--config`, else `~/.config/courtchat-server/config.toml` when present:
//!
//! ```toml
//! bind = "0.0.0.0:8080"
//!
//! [history]
//! default_page_size = 20
//! max_page_size = 100
//! ```

use std::path::{Path, PathBuf};

use courtchat_proto::history::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// Why the settings could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

/// On-disk form; every key optional.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    bind: Option<String>,
    history: HistorySettings,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct HistorySettings {
    default_page_size: Option<u32>,
    max_page_size: Option<u32>,
}

/// Command line of `courtchat-server`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Paged history and live rooms for CourtChat clients")]
pub struct ServerCliArgs {
    /// Listen address.
    #[arg(short, long, env = "COURTCHAT_SERVER_ADDR")]
    pub bind: Option<String>,

    /// Settings file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// History page size when a request gives none.
    #[arg(long)]
    pub default_page_size: Option<u32>,

    /// Cap on the requested history page size.
    #[arg(long)]
    pub max_page_size: Option<u32>,

    /// Tracing filter, e.g. `info` or `courtchat_server=debug`.
    #[arg(long, default_value = "info", env = "COURTCHAT_SERVER_LOG")]
    pub log_level: String,
}

/// How many messages one history response may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    default_size: u32,
    max_size: u32,
}

impl PageLimits {
    /// Both sizes are raised to at least 1 and `default_size` is capped at
    /// `max_size`.
    #[must_use]
    pub fn new(default_size: u32, max_size: u32) -> Self {
        let max_size = max_size.max(1);
        Self {
            default_size: default_size.clamp(1, max_size),
            max_size,
        }
    }

    /// Size to serve for a request that asked for `requested`.
    #[must_use]
    pub fn size_for(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_size)
            .clamp(1, self.max_size)
    }

    #[must_use]
    pub const fn default_size(&self) -> u32 {
        self.default_size
    }

    #[must_use]
    pub const fn max_size(&self) -> u32 {
        self.max_size
    }
}

impl Default for PageLimits {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

/// Resolved server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub pages: PageLimits,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.to_string(),
            pages: PageLimits::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Read the settings file, if any, and apply `cli` over it.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ReadFile`] when `--config` names a file that cannot be
    /// read, [`ConfigError::ParseToml`] when a file is not valid settings.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => read_settings(path)?,
            None => match dirs::config_dir() {
                Some(dir) => read_optional_settings(&dir.join("courtchat-server/config.toml"))?,
                None => SettingsFile::default(),
            },
        };
        Ok(Self::merge(cli, file))
    }

    fn merge(cli: &ServerCliArgs, file: SettingsFile) -> Self {
        let fallback = PageLimits::default();
        let max = cli
            .max_page_size
            .or(file.history.max_page_size)
            .unwrap_or(fallback.max_size());
        let default = cli
            .default_page_size
            .or(file.history.default_page_size)
            .unwrap_or(fallback.default_size());

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.bind)
                .unwrap_or_else(|| DEFAULT_BIND.to_string()),
            pages: PageLimits::new(default, max),
            log_level: cli.log_level.clone(),
        }
    }
}

fn read_settings(path: &Path) -> Result<SettingsFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

/// Like [`read_settings`], but a missing file means "no settings".
fn read_optional_settings(path: &Path) -> Result<SettingsFile, ConfigError> {
    if path.exists() {
        read_settings(path)
    } else {
        Ok(SettingsFile::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> SettingsFile {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn built_in_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.pages.default_size(), 20);
        assert_eq!(config.pages.max_size(), 100);
    }

    #[test]
    fn file_sets_bind_and_history_limits() {
        let file = parse(
            r#"
            bind = "127.0.0.1:9100"

            [history]
            max_page_size = 30
            "#,
        );
        let config = ServerConfig::merge(&ServerCliArgs::default(), file);
        assert_eq!(config.bind_addr, "127.0.0.1:9100");
        assert_eq!(config.pages.max_size(), 30);
        assert_eq!(config.pages.default_size(), 20);
    }

    #[test]
    fn command_line_beats_file() {
        let file = parse(
            r#"
            bind = "127.0.0.1:9100"
            [history]
            default_page_size = 50
            "#,
        );
        let cli = ServerCliArgs {
            bind: Some("127.0.0.1:9200".into()),
            default_page_size: Some(10),
            ..ServerCliArgs::default()
        };
        let config = ServerConfig::merge(&cli, file);
        assert_eq!(config.bind_addr, "127.0.0.1:9200");
        assert_eq!(config.pages.default_size(), 10);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<SettingsFile>("bind_address = \"x\"").is_err());
    }

    #[test]
    fn page_limits_keep_sizes_in_range() {
        let limits = PageLimits::new(500, 40);
        assert_eq!(limits.default_size(), 40);
        assert_eq!(limits.size_for(None), 40);
        assert_eq!(limits.size_for(Some(0)), 1);
        assert_eq!(limits.size_for(Some(7)), 7);
        assert_eq!(limits.size_for(Some(1_000)), 40);

        let degenerate = PageLimits::new(0, 0);
        assert_eq!(degenerate.size_for(None), 1);
    }

    #[test]
    fn named_file_must_exist() {
        let cli = ServerCliArgs {
            config: Some(PathBuf::from("/nonexistent/courtchat-server.toml")),
            ..ServerCliArgs::default()
        };
        assert!(matches!(
            ServerConfig::load(&cli),
            Err(ConfigError::ReadFile { .. })
        ));
    }

    #[test]
    fn absent_default_file_is_empty() {
        let settings = read_optional_settings(Path::new("/nonexistent/courtchat-server.toml")).unwrap();
        assert!(settings.bind.is_none());
    }
}
