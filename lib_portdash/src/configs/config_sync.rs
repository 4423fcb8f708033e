//! # Sync Configuration
//!
//! Layered configuration for the dashboard client. Values are resolved from,
//! in increasing priority: built-in defaults, a JSON config file, then
//! environment variables and command-line flags (both handled by `clap`).

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "portdash.conf";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// Path that was tried.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`SyncConfig`].
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was tried.
        path: PathBuf,
        /// Underlying JSON failure.
        #[source]
        source: serde_json::Error,
    },

    /// An explicitly requested config file does not exist.
    #[error("Config file not found: {0}")]
    MissingFile(PathBuf),

    /// The origin is not an absolute URL.
    #[error("Invalid origin '{origin}': {source}")]
    InvalidOrigin {
        /// Offending value.
        origin: String,
        /// Parser failure.
        #[source]
        source: url::ParseError,
    },

    /// The origin scheme is neither `http` nor `https`.
    #[error("Unsupported origin scheme '{0}' (expected http or https)")]
    UnsupportedScheme(String),
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Portfolio dashboard live sync client", version)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[clap(long, env = "PORTDASH_ORIGIN", help = "Origin serving the dashboard, e.g. https://dash.example.com.")]
    pub origin: Option<String>,

    #[clap(long, env = "PORTDASH_WS_PATH", help = "Path of the push WebSocket on the origin.")]
    pub ws_path: Option<String>,

    #[clap(long, env = "PORTDASH_RECONNECT_DELAY_MS", help = "Fixed delay in milliseconds before each reconnect attempt.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "PORTDASH_MAX_RECONNECT_ATTEMPTS", help = "Reconnect attempts before giving up.")]
    pub max_reconnect_attempts: Option<u32>,

    #[clap(long, env = "PORTDASH_HTTP_MAX_RETRIES", help = "Retries for transient REST failures.")]
    pub http_max_retries: Option<u32>,

    #[clap(long, env = "PORTDASH_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PORTDASH_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PORTDASH_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,
}

impl SyncConfig {
    /// Built-in defaults.
    pub fn defaults() -> Self {
        Self {
            origin: Some("http://localhost:8080".to_string()),
            ws_path: Some("/ws".to_string()),
            reconnect_delay_ms: Some(3000),
            max_reconnect_attempts: Some(5),
            http_max_retries: Some(2),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            config_path: None,
        }
    }

    // 'other' wins wherever it has a value
    fn merge(self, other: SyncConfig) -> SyncConfig {
        SyncConfig {
            origin: other.origin.or(self.origin),
            ws_path: other.ws_path.or(self.ws_path),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
            http_max_retries: other.http_max_retries.or(self.http_max_retries),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            config_path: other.config_path.or(self.config_path),
        }
    }

    /// Validates the merged values and derives the connection targets.
    pub fn resolve(&self) -> Result<SyncSettings, ConfigError> {
        let defaults = SyncConfig::defaults();
        let merged = defaults.merge(self.clone());

        let origin_str = merged.origin.unwrap_or_default();
        let origin = Url::parse(&origin_str).map_err(|source| ConfigError::InvalidOrigin {
            origin: origin_str.clone(),
            source,
        })?;
        let websocket_url = websocket_url(&origin, merged.ws_path.as_deref().unwrap_or("/ws"))?;

        Ok(SyncSettings {
            origin,
            websocket_url,
            reconnect_delay: Duration::from_millis(merged.reconnect_delay_ms.unwrap_or(3000)),
            max_reconnect_attempts: merged.max_reconnect_attempts.unwrap_or(5),
            http_max_retries: merged.http_max_retries.unwrap_or(2),
            log_dir: merged.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: merged.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Validated settings used to build the connection and the data provider.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Origin of the dashboard; REST paths are joined onto it.
    pub origin: Url,
    /// Push socket URL derived from the origin.
    pub websocket_url: Url,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Reconnect attempts before the connection gives up.
    pub max_reconnect_attempts: u32,
    /// Retries for transient REST failures.
    pub http_max_retries: u32,
    /// Where log files go.
    pub log_dir: PathBuf,
    /// Log level name.
    pub log_level: String,
}

impl SyncSettings {
    /// Settings for `origin` with every other value at its default.
    pub fn for_origin(origin: &str) -> Result<Self, ConfigError> {
        SyncConfig {
            origin: Some(origin.to_string()),
            ..Default::default()
        }
        .resolve()
    }
}

/// Swaps `http`/`https` for `ws`/`wss` and replaces the path.
pub fn websocket_url(origin: &Url, ws_path: &str) -> Result<Url, ConfigError> {
    let scheme = match origin.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };

    let mut url = origin.clone();
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(origin.scheme().to_string()))?;
    if ws_path.starts_with('/') {
        url.set_path(ws_path);
    } else {
        url.set_path(&format!("/{}", ws_path));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Merges defaults, the config file and already parsed CLI/env values.
///
/// The file is `cli.config_path` when given (and must then exist), otherwise
/// [`DEFAULT_CONFIG_FILE`] if present.
pub fn load_config(cli: SyncConfig) -> Result<SyncConfig, ConfigError> {
    let mut current = SyncConfig::defaults();

    let explicit = cli.config_path.is_some();
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if path.exists() {
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: SyncConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        log::info!("Loaded config file {}", path.display());
        current = current.merge(file_config);
    } else if explicit {
        return Err(ConfigError::MissingFile(path));
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
    }

    Ok(current.merge(cli))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_http_origin_maps_to_ws() {
        let settings = SyncSettings::for_origin("http://localhost:8080/dashboard?x=1").unwrap();
        assert_eq!(settings.websocket_url.as_str(), "ws://localhost:8080/ws");
        assert_eq!(settings.reconnect_delay, Duration::from_millis(3000));
        assert_eq!(settings.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_https_origin_maps_to_wss() {
        let origin = Url::parse("https://dash.example.com").unwrap();
        let url = websocket_url(&origin, "live").unwrap();
        assert_eq!(url.as_str(), "wss://dash.example.com/live");
    }

    #[test]
    fn test_rejects_bad_origins() {
        assert!(matches!(
            SyncSettings::for_origin("ftp://example.com"),
            Err(ConfigError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(
            SyncSettings::for_origin("not a url"),
            Err(ConfigError::InvalidOrigin { .. })
        ));
    }

    #[test]
    fn test_cli_overrides_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"origin":"https://file.example.com","reconnectDelayMs":1500,"maxReconnectAttempts":2}}"#
        )
        .unwrap();

        let cli = SyncConfig::try_parse_from([
            "portdash",
            "--config-path",
            file.path().to_str().unwrap(),
            "--max-reconnect-attempts",
            "9",
        ])
        .unwrap();

        let merged = load_config(cli).unwrap();
        assert_eq!(merged.origin.as_deref(), Some("https://file.example.com"));
        assert_eq!(merged.reconnect_delay_ms, Some(1500));
        assert_eq!(merged.max_reconnect_attempts, Some(9));
        assert_eq!(merged.ws_path.as_deref(), Some("/ws"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let cli = SyncConfig {
            config_path: Some(PathBuf::from("/definitely/not/here/portdash.conf")),
            ..Default::default()
        };
        assert!(matches!(load_config(cli), Err(ConfigError::MissingFile(_))));
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "origin = nope").unwrap();
        let cli = SyncConfig {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(load_config(cli), Err(ConfigError::Parse { .. })));
    }
}
