//! # Observability
//!
//! Logging initialization shared by the Herald binaries.
//!
//! Library code never configures logging. It uses the standard `tracing`
//! macros and leaves the decision of where events go to the binary, which
//! calls [`init`] or [`init_with_config`] exactly once at startup.
//!
//! Two output shapes are supported:
//!
//! - **Compact**: human-readable lines on stderr (the default).
//! - **JSONL**: one JSON object per line, appended to a file, with
//!   `timestamp`, `level`, `service`, `pid`, `target`, `message` and the
//!   structured event fields. Optionally mirrored to stderr.
//!
//! ## Usage
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "herald".into(),
//!     default_level: "debug".into(),
//!     format: observability::LogFormat::Json,
//!     log_path: Some("/var/log/herald.jsonl".into()),
//!     also_stderr: true,
//! })?;
//! ```

mod file_writer;
mod json_layer;

use std::io;
use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use file_writer::{AppendFileWriter, WriterFactory};
pub use json_layer::{JsonLayer, LogEntry};

/// Output shape for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines on stderr.
    #[default]
    Compact,
    /// Structured JSON lines written to `log_path`.
    Json,
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every JSON line.
    pub service_name: String,

    /// Default level filter (e.g. "debug", "info").
    /// `RUST_LOG` takes precedence when set.
    pub default_level: String,

    /// Output shape.
    pub format: LogFormat,

    /// JSONL destination. Required for [`LogFormat::Json`]; when absent the
    /// JSON lines go to stderr instead.
    pub log_path: Option<PathBuf>,

    /// Mirror events to stderr in compact form when writing JSON to a file.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            format: LogFormat::Compact,
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Initialize logging with default settings for `service_name`.
pub fn init(service_name: &str) -> io::Result<()> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Initialize logging with a custom configuration.
///
/// Returns an error if the log file cannot be opened. A second call in the
/// same process is ignored (the first subscriber stays installed).
pub fn init_with_config(config: LogConfig) -> io::Result<()> {
    let filter = env_filter(&config.default_level);

    match config.format {
        LogFormat::Compact => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(io::stderr)
                .compact()
                .try_init();
        }
        LogFormat::Json => {
            let json_layer = match &config.log_path {
                Some(path) => {
                    let writer = AppendFileWriter::new(path)?;
                    JsonLayer::new(config.service_name.clone(), WriterFactory::file(writer))
                }
                None => JsonLayer::new(config.service_name.clone(), WriterFactory::stderr()),
            };

            let stderr_layer = (config.also_stderr && config.log_path.is_some()).then(|| {
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .compact()
                    .with_writer(io::stderr)
                    .with_filter(env_filter(&config.default_level))
            });

            let _ = tracing_subscriber::registry()
                .with(json_layer.with_filter(filter))
                .with(stderr_layer)
                .try_init();

            if let Some(path) = &config.log_path {
                tracing::info!(log_path = %path.display(), "observability initialized");
            }
        }
    }

    Ok(())
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

pub use tracing::{debug, error, info, instrument, trace, warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "unknown");
        assert_eq!(config.default_level, "info");
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.log_path.is_none());
        assert!(!config.also_stderr);
    }

    #[test]
    fn test_init_json_unwritable_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as an append-only file.
        let result = init_with_config(LogConfig {
            service_name: "test".into(),
            format: LogFormat::Json,
            log_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
