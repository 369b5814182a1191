//! # Observability
//!
//! Logging setup for the outbox relay.
//!
//! Binaries call [`init_with_config`] once at startup and then use the plain
//! `tracing` macros everywhere else. Library crates never install a
//! subscriber themselves.
//!
//! Two output formats are supported:
//!
//! - [`LogFormat::Compact`]: human readable, one line per event, to stderr.
//! - [`LogFormat::Json`]: one JSON object per line (JSONL), either to stderr
//!   or appended to [`LogConfig::log_path`].
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "outbox-relay".into(),
//!     default_level: "debug".into(),
//!     format: observability::LogFormat::Json,
//!     ..Default::default()
//! });
//! ```

mod file_writer;
mod json_layer;

use std::path::PathBuf;
use std::str::FromStr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use file_writer::{FileWriter, FileWriterFactory};
pub use json_layer::{JsonLayer, LogEntry};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Compact,
    /// Structured JSON lines.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" | "pretty" => Ok(Self::Compact),
            "json" | "jsonl" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, written into every JSON line.
    pub service_name: String,

    /// Default level filter (e.g. "debug", "info,outbox_relay=trace").
    /// `RUST_LOG` takes precedence when set.
    pub default_level: String,

    /// Output format.
    pub format: LogFormat,

    /// Append JSON lines to this file instead of stderr.
    /// Ignored for [`LogFormat::Compact`].
    pub log_path: Option<PathBuf>,

    /// When writing JSON to a file, also print compact lines to stderr.
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

/// Initialize logging with default settings for the given service.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init_with_config(config: LogConfig) {
    let filter = build_filter(&config.default_level);

    match config.format {
        LogFormat::Compact => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .compact()
                .with_writer(std::io::stderr)
                .try_init();
        }
        LogFormat::Json => init_json(&config, filter),
    }
}

fn init_json(config: &LogConfig, filter: EnvFilter) {
    let Some(path) = config.log_path.as_ref() else {
        let layer = JsonLayer::new(config.service_name.clone(), std::io::stderr);
        let _ = tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init();
        return;
    };

    let factory = match FileWriterFactory::open(path) {
        Ok(factory) => factory,
        Err(e) => {
            // Fall back to stderr rather than refusing to start.
            eprintln!("failed to open log file {}: {e}", path.display());
            let layer = JsonLayer::new(config.service_name.clone(), std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(layer.with_filter(filter))
                .try_init();
            return;
        }
    };

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(build_filter(&config.default_level))
    });

    let _ = tracing_subscriber::registry()
        .with(JsonLayer::new(config.service_name.clone(), factory).with_filter(filter))
        .with(stderr_layer)
        .try_init();

    tracing::info!(log_path = %path.display(), "observability initialized");
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};
