use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use crate::context::AccessRecord;
use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record, info};
use serde_json::{Value, json};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Log target carrying one access record per connection.
pub const ACCESS_TARGET: &str = "wormhole::access";

/// Receives the record of every finished connection.
pub trait AccessLog: Send + Sync {
    fn record(&self, record: &AccessRecord);
}

/// Writes access records through the `log` facade at info level.
#[derive(Debug, Clone, Copy)]
pub struct LogAccessLog {
    format: LogFormat,
}

impl LogAccessLog {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }
}

impl AccessLog for LogAccessLog {
    fn record(&self, record: &AccessRecord) {
        match self.format {
            LogFormat::Text => info!(target: ACCESS_TARGET, "{}", record),
            LogFormat::Json => match serde_json::to_string(record) {
                Ok(line) => info!(target: ACCESS_TARGET, "{}", line),
                Err(_) => info!(target: ACCESS_TARGET, "{}", record),
            },
        }
    }
}

pub struct CustomLogger {
    level: LevelFilter,
    targets: Vec<LogTarget>,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, ProxyError> {
        let level = config.level.unwrap_or_default().to_filter();
        let format = config.format.unwrap_or_default();
        let targets = config.targets.unwrap_or_else(|| {
            vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]
        });

        let mut writers = Vec::new();

        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or_else(|| {
                        ProxyError::Config("file log target requires a path".to_string())
                    })?;
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(|source| ProxyError::Load {
                            path: path.clone(),
                            source,
                        })?;
                    Box::new(file)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            level,
            targets,
            format,
            writers,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), ProxyError> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level();
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| ProxyError::Config(format!("logger already set: {e}")))?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Most verbose level any target will accept.
    fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|target| self.target_level(target))
            .max()
            .unwrap_or(self.level)
    }

    fn target_level(&self, target: &LogTarget) -> LevelFilter {
        target.level.map(LogLevel::to_filter).unwrap_or(self.level)
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] [{}:{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level().to_string().to_uppercase(),
            record.target(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        let timestamp_str = timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let message = record.args().to_string();
        let mut log_entry = json!({
            "timestamp": timestamp_str,
            "level": record.level().to_string().to_lowercase(),
            "target": record.target(),
            "module": record.module_path().unwrap_or("unknown"),
            "file": record.file().unwrap_or("unknown"),
            "line": record.line().unwrap_or(0),
        });

        // Access records arrive pre-serialized; nest them as an object.
        let access = (record.target() == ACCESS_TARGET)
            .then(|| serde_json::from_str::<Value>(&message).ok())
            .flatten()
            .filter(Value::is_object);
        match access {
            Some(access) => log_entry["access"] = access,
            None => log_entry["message"] = Value::String(message),
        }

        serde_json::to_string(&log_entry).unwrap_or_else(|_| {
            json!({"error": "Failed to serialize log entry", "raw_message": record.args().to_string()})
                .to_string()
        })
    }
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.targets
            .iter()
            .any(|target| metadata.level() <= self.target_level(target))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for (target, writer) in self.targets.iter().zip(&self.writers) {
            if record.level() <= self.target_level(target) {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

/// env_logger backend used when the config has no `logging` block.
/// `RUST_LOG` wins over `default_level`.
pub fn init_fallback(default_level: LevelFilter, format: LogFormat) -> Result<(), ProxyError> {
    let env = env_logger::Env::default().default_filter_or(default_level.as_str().to_lowercase());
    let mut builder = env_logger::Builder::from_env(env);

    if format == LogFormat::Json {
        builder.format(|buf, record| {
            let timestamp: DateTime<Utc> = Utc::now();
            let log_entry = json!({
                "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", log_entry)
        });
    }

    builder
        .try_init()
        .map_err(|e| ProxyError::Config(format!("logger already set: {e}")))
}

/// Level for `-v` repetitions: none is info, one is debug, more is trace.
pub fn verbosity_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Level for the env_logger backend: `--log-level` if given, raised by any `-v`.
pub fn fallback_level(level: Option<LogLevel>, verbose: u8) -> LevelFilter {
    match level {
        Some(level) if verbose == 0 => level.to_filter(),
        Some(level) => level.to_filter().max(verbosity_level(verbose)),
        None => verbosity_level(verbose),
    }
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, ProxyError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(ProxyError::Config(format!(
            "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, ProxyError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ProxyError::Config(format!(
            "Invalid log format: {}. Must be one of: text, json",
            s
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Log};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn file_logger(dir: &TempDir, format: LogFormat, level: Option<LogLevel>) -> (CustomLogger, PathBuf) {
        let path = dir.path().join("wormhole.log");
        let logger = CustomLogger::new(LoggingConfig {
            level: Some(LogLevel::Info),
            format: Some(format),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: Some(path.clone()),
                level,
            }]),
        })
        .unwrap();
        (logger, path)
    }

    #[test]
    fn target_level_filters_records() {
        let dir = TempDir::new().unwrap();
        let (logger, path) = file_logger(&dir, LogFormat::Text, Some(LogLevel::Warn));
        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("wormhole")
                .args(format_args!("quiet"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Error)
                .target("wormhole")
                .args(format_args!("loud"))
                .build(),
        );
        logger.flush();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(!content.contains("quiet"));
        assert!(content.contains("[ERROR] [wormhole]"));
        assert!(content.contains("loud"));
    }

    #[test]
    fn json_access_records_are_nested() {
        let dir = TempDir::new().unwrap();
        let (logger, path) = file_logger(&dir, LogFormat::Json, None);
        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target(ACCESS_TARGET)
                .args(format_args!("{}", r#"{"connectionId":"00002a","outcome":"Forwarded"}"#))
                .build(),
        );
        logger.flush();
        let content = std::fs::read_to_string(path).unwrap();
        let entry: Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(entry["target"], ACCESS_TARGET);
        assert_eq!(entry["access"]["connectionId"], "00002a");
        assert!(entry.get("message").is_none());
    }

    #[test]
    fn file_target_without_path_is_rejected() {
        let result = CustomLogger::new(LoggingConfig {
            level: None,
            format: None,
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: None,
                level: None,
            }]),
        });
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn parses_cli_values() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), LogLevel::Debug);
        assert!(parse_log_level("loud").is_err());
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert_eq!(verbosity_level(0), LevelFilter::Info);
        assert_eq!(verbosity_level(3), LevelFilter::Trace);
    }

    #[test]
    fn log_level_flag_combines_with_verbosity() {
        assert_eq!(fallback_level(None, 0), LevelFilter::Info);
        assert_eq!(fallback_level(Some(LogLevel::Warn), 0), LevelFilter::Warn);
        assert_eq!(fallback_level(Some(LogLevel::Warn), 1), LevelFilter::Debug);
        assert_eq!(fallback_level(Some(LogLevel::Trace), 1), LevelFilter::Trace);
        assert_eq!(fallback_level(None, 2), LevelFilter::Trace);
    }
}
