use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ProxyError;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8800";
pub const DEFAULT_AUTH_REALM: &str = "Wormhole Proxy";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_HEADER_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const MIN_HEADER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_filter().as_str().to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// Proxy configuration. Every field is optional in the JSON file; the
/// accessors below apply defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
    // Credentials file, one `user:secret` per line. Enables authentication.
    #[serde(default)]
    pub auth_file: Option<PathBuf>,
    #[serde(default)]
    pub auth_realm: Option<String>,
    #[serde(default)]
    pub block_list: Option<PathBuf>,
    #[serde(default)]
    pub allow_list: Option<PathBuf>,
    #[serde(default)]
    pub allow_private: Option<bool>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub header_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_header_size: Option<usize>,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ProxyError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fully populated config, used for `--generate-config`.
    pub fn sample() -> Self {
        Self {
            listen_addr: Some(([127, 0, 0, 1], 8800).into()),
            auth_file: Some(PathBuf::from("credentials.txt")),
            auth_realm: Some(DEFAULT_AUTH_REALM.to_string()),
            block_list: Some(PathBuf::from("blocklist.txt")),
            allow_list: None,
            allow_private: Some(false),
            connect_timeout_secs: Some(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
            header_timeout_secs: Some(DEFAULT_HEADER_TIMEOUT_SECS),
            max_header_size: Some(DEFAULT_MAX_HEADER_SIZE),
            max_connections: Some(DEFAULT_MAX_CONNECTIONS),
            logging: Some(LoggingConfig::default()),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8800)))
    }

    pub fn auth_realm(&self) -> &str {
        self.auth_realm.as_deref().unwrap_or(DEFAULT_AUTH_REALM)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs.unwrap_or(DEFAULT_HEADER_TIMEOUT_SECS))
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size.unwrap_or(DEFAULT_MAX_HEADER_SIZE)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Format for log lines and access records: the `logging` block's format,
    /// else `fallback` (the command line), else text.
    pub fn log_format(&self, fallback: Option<LogFormat>) -> LogFormat {
        self.logging
            .as_ref()
            .and_then(|logging| logging.format)
            .or(fallback)
            .unwrap_or_default()
    }

    /// Rejects values the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.max_header_size() < MIN_HEADER_SIZE {
            return Err(ProxyError::Config(format!(
                "max_header_size must be at least {MIN_HEADER_SIZE} bytes, got {}",
                self.max_header_size()
            )));
        }
        let timeouts = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("header_timeout_secs", self.header_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == Some(0) {
                return Err(ProxyError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.max_connections() == 0 {
            return Err(ProxyError::Config(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        let files = [
            ("auth_file", &self.auth_file),
            ("block_list", &self.block_list),
            ("allow_list", &self.allow_list),
        ];
        for (name, path) in files {
            if let Some(path) = path {
                if !path.is_file() {
                    return Err(ProxyError::Config(format!(
                        "{name} {} does not exist",
                        path.display()
                    )));
                }
            }
        }

        if let Some(targets) = self.logging.as_ref().and_then(|l| l.targets.as_ref()) {
            for target in targets {
                if target.output_type == LogOutputType::File && target.path.is_none() {
                    return Err(ProxyError::Config(
                        "file log target requires a path".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_apply_to_empty_file() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_addr(), DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert_eq!(config.auth_realm(), "Wormhole Proxy");
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.idle_timeout(), Duration::from_secs(90));
        assert_eq!(config.header_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_header_size(), 16384);
        assert_eq!(config.max_connections(), 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_logging_block() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "listen_addr": "0.0.0.0:3128",
                "idle_timeout_secs": 30,
                "logging": {{"level": "debug", "format": "json", "targets": [{{"type": "stdout"}}]}}
            }}"#
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listen_addr().port(), 3128);
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        let logging = config.logging.unwrap();
        assert_eq!(logging.level, Some(LogLevel::Debug));
        assert_eq!(logging.format, Some(LogFormat::Json));
    }

    #[test]
    fn log_format_prefers_logging_block_over_command_line() {
        let config = Config::default();
        assert_eq!(config.log_format(None), LogFormat::Text);
        assert_eq!(config.log_format(Some(LogFormat::Json)), LogFormat::Json);

        let config = Config {
            logging: Some(LoggingConfig {
                format: Some(LogFormat::Text),
                ..LoggingConfig::default()
            }),
            ..Config::default()
        };
        assert_eq!(config.log_format(Some(LogFormat::Json)), LogFormat::Text);

        let config = Config {
            logging: Some(LoggingConfig {
                format: None,
                ..LoggingConfig::default()
            }),
            ..Config::default()
        };
        assert_eq!(config.log_format(Some(LogFormat::Json)), LogFormat::Json);
    }

    #[test]
    fn rejects_tiny_header_limit_and_zero_timeouts() {
        let config = Config {
            max_header_size: Some(100),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));

        let config = Config {
            header_timeout_secs: Some(0),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("header_timeout_secs"));
    }

    #[test]
    fn rejects_missing_list_file() {
        let config = Config {
            block_list: Some(PathBuf::from("/nonexistent/wormhole/blocklist.txt")),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("block_list"));
    }

    #[test]
    fn sample_round_trips_through_file() {
        let file = NamedTempFile::new().unwrap();
        Config::sample().to_file(file.path()).unwrap();
        let loaded = Config::from_file(file.path()).unwrap();
        assert_eq!(loaded.auth_realm(), DEFAULT_AUTH_REALM);
        assert_eq!(loaded.max_connections(), DEFAULT_MAX_CONNECTIONS);
    }
}
