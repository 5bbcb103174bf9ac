//! Structured logging setup
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! binary's job. This module builds that subscriber:
//!
//! - `EnvFilter` from `RUST_LOG` when set, otherwise from the configured level
//! - extra comma-separated directives from `POOLSRV_LOG_TARGET_FILTER`
//! - a fmt layer in JSON (production) or pretty (development) format
//! - optional non-blocking output through `tracing_appender`
//!
//! Events go to stderr; stdout is left to command output.
//!
//! ## Environment Variables
//!
//! - `POOLSRV_LOG_LEVEL`: trace/debug/info/warn/error (default: info)
//! - `POOLSRV_LOG_FORMAT`: json/pretty (default: pretty)
//! - `POOLSRV_LOG_ASYNC`: buffer output on a background thread (default: false)
//! - `POOLSRV_LOG_TARGET_FILTER`: extra directives, e.g. `poolserver::worker=debug`

use anyhow::{Context, Result};
use std::env;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log format: JSON for production, pretty-print for development
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty, // Default to pretty
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level: trace/debug/info/warn/error
    pub log_level: String,
    /// Log format: json/pretty
    pub format: LogFormat,
    /// Write through a background thread
    pub async_logging: bool,
    /// Module filter (comma-separated directives)
    pub target_filter: Option<String>,
    /// Include file:line location
    pub include_location: bool,
}

impl LogConfig {
    /// Parse configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            log_level: env::var("POOLSRV_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: LogFormat::parse(
                &env::var("POOLSRV_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            ),
            async_logging: env::var("POOLSRV_LOG_ASYNC")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
            target_filter: env::var("POOLSRV_LOG_TARGET_FILTER").ok(),
            include_location: false,
        }
    }

    /// Verbose configuration for local development and tests
    pub fn default_dev() -> Self {
        Self {
            log_level: "debug".to_string(),
            format: LogFormat::Pretty,
            async_logging: false,
            target_filter: None,
            include_location: true,
        }
    }

    fn level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Keeps the async writer alive. Buffered events are flushed when it drops,
/// so hold it until the end of `main`.
#[derive(Debug)]
#[must_use = "dropping the guard stops async log output"]
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

/// Build the `EnvFilter` for `config`.
///
/// Directives that fail to parse are reported on stderr and skipped; there is
/// no subscriber yet to report them to.
pub fn build_filter(config: &LogConfig) -> EnvFilter {
    let mut env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level().as_str()));

    if let Some(target_filter) = &config.target_filter {
        for filter in target_filter.split(',') {
            let filter = filter.trim();
            if filter.is_empty() {
                continue;
            }
            match filter.parse() {
                Ok(directive) => env_filter = env_filter.add_directive(directive),
                Err(_) => eprintln!("Warning: Invalid log filter directive: {}", filter),
            }
        }
    }

    env_filter
}

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
///
/// # Example
///
/// ```no_run
/// use poolserver::logging::{init_logging_with_config, LogConfig};
///
/// let _guard = init_logging_with_config(&LogConfig::from_env())?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn init_logging_with_config(config: &LogConfig) -> Result<LoggingGuard> {
    let registry = tracing_subscriber::registry().with(build_filter(config));

    let (fmt_layer, worker) = if config.async_logging {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
        let layer = match config.format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_thread_names(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_writer(writer)
                .boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_names(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_writer(writer)
                .boxed(),
        };
        (layer, Some(guard))
    } else {
        let layer = match config.format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_thread_names(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_names(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_writer(std::io::stderr)
                .boxed(),
        };
        (layer, None)
    };

    registry
        .with(fmt_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(LoggingGuard { _worker: worker })
}
