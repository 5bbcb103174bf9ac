//! # Server Configuration
//!
//! Everything the server needs is carried in one [`ServerConfig`] value; there
//! is no process-wide mutable state.
//!
//! Values are layered, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. a YAML (or `.toml`) file via [`ServerConfig::from_file`]
//! 3. `POOLSRV_*` environment variables via [`ServerConfig::apply_env`]
//! 4. command-line flags (applied by the binary)
//!
//! ## Example
//!
//! ```yaml
//! listen_address: 0.0.0.0:8080
//! worker_count: 8
//! shutdown_poll_interval_ms: 500
//! queue_bound: 256
//! backpressure_mode: shed
//! ```
//!
//! ## Environment Variables
//!
//! - `POOLSRV_LISTEN_ADDRESS`: host:port to bind
//! - `POOLSRV_WORKERS`: number of worker threads
//! - `POOLSRV_POLL_INTERVAL_MS`: upper bound on shutdown latency (default: 2000)
//! - `POOLSRV_LISTEN_BACKLOG`: listen(2) backlog (default: 128)
//! - `POOLSRV_QUEUE_BOUND`, `POOLSRV_BACKPRESSURE_MODE`,
//!   `POOLSRV_BACKPRESSURE_TIMEOUT_MS`, `POOLSRV_STACK_SIZE`: see
//!   [`worker_pool`](crate::worker_pool)

use crate::error::{Result, ServerError};
use crate::worker_pool::{env_parse, parse_size, BackpressureMode, WorkerPoolConfig};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_LISTEN_BACKLOG: i32 = 128;

/// Complete server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind, e.g. `127.0.0.1:8080` (port 0 picks a free port)
    pub listen_address: String,
    /// Fixed number of worker threads
    pub worker_count: usize,
    /// How long one accept wait lasts before the stop flag is re-checked
    #[serde(default = "default_poll_interval_ms")]
    pub shutdown_poll_interval_ms: u64,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Queue capacity; absent means unbounded
    #[serde(default)]
    pub queue_bound: Option<usize>,
    #[serde(default)]
    pub backpressure_mode: BackpressureMode,
    #[serde(default = "default_backpressure_timeout_ms")]
    pub backpressure_timeout_ms: u64,
    #[serde(default)]
    pub worker_stack_size: Option<usize>,
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_listen_backlog() -> i32 {
    DEFAULT_LISTEN_BACKLOG
}

fn default_backpressure_timeout_ms() -> u64 {
    WorkerPoolConfig::default().backpressure_timeout_ms
}

fn default_thread_name_prefix() -> String {
    WorkerPoolConfig::default().thread_name_prefix
}

impl ServerConfig {
    /// Configuration with the given address and worker count, defaults elsewhere.
    pub fn new(listen_address: impl Into<String>, worker_count: usize) -> Self {
        Self {
            listen_address: listen_address.into(),
            worker_count,
            shutdown_poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            queue_bound: None,
            backpressure_mode: BackpressureMode::default(),
            backpressure_timeout_ms: default_backpressure_timeout_ms(),
            worker_stack_size: None,
            thread_name_prefix: default_thread_name_prefix(),
        }
    }

    /// Load from a YAML file, or TOML when the extension is `.toml`.
    ///
    /// The result is not validated; call [`validate`](Self::validate) once
    /// every layer has been applied.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_error = |message: String| ServerError::Config {
            path: path.to_path_buf(),
            message,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&contents).map_err(|e| config_error(e.to_string()))
        } else {
            serde_yaml::from_str(&contents).map_err(|e| config_error(e.to_string()))
        }
    }

    /// Override fields that have a corresponding environment variable set.
    pub fn apply_env(&mut self) {
        if let Some(addr) = env_parse("POOLSRV_LISTEN_ADDRESS", |s| Some(s.to_string())) {
            self.listen_address = addr;
        }
        if let Some(n) = env_parse("POOLSRV_WORKERS", |s| s.parse().ok()) {
            self.worker_count = n;
        }
        if let Some(ms) = env_parse("POOLSRV_POLL_INTERVAL_MS", |s| s.parse().ok()) {
            self.shutdown_poll_interval_ms = ms;
        }
        if let Some(backlog) = env_parse("POOLSRV_LISTEN_BACKLOG", |s| s.parse().ok()) {
            self.listen_backlog = backlog;
        }

        // Pool settings share their parsing with `WorkerPoolConfig`.
        let mut pool = self.to_pool_config();
        pool.apply_env();
        self.queue_bound = pool.queue_bound;
        self.backpressure_mode = pool.backpressure_mode;
        self.backpressure_timeout_ms = pool.backpressure_timeout_ms;
        self.worker_stack_size = pool.stack_size;
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(ServerError::invalid("worker_count must be greater than zero"));
        }
        if self.queue_bound == Some(0) {
            return Err(ServerError::invalid(
                "queue_bound must be greater than zero (omit it for an unbounded queue)",
            ));
        }
        if self.shutdown_poll_interval_ms == 0 {
            return Err(ServerError::invalid(
                "shutdown_poll_interval_ms must be greater than zero",
            ));
        }
        if self.backpressure_timeout_ms == 0 {
            return Err(ServerError::invalid(
                "backpressure_timeout_ms must be greater than zero",
            ));
        }
        if self.listen_backlog <= 0 {
            return Err(ServerError::invalid("listen_backlog must be greater than zero"));
        }
        if let Some(size) = self.worker_stack_size {
            if size == 0 {
                return Err(ServerError::invalid("worker_stack_size must be greater than zero"));
            }
        }
        self.resolve_address()?;
        Ok(())
    }

    /// Resolve `listen_address` to the first socket address it names.
    pub fn resolve_address(&self) -> Result<SocketAddr> {
        let addr = self.listen_address.trim();
        if addr.is_empty() {
            return Err(ServerError::invalid("listen_address is empty"));
        }
        addr.to_socket_addrs()
            .map_err(|e| {
                ServerError::invalid(format!("cannot resolve listen_address {addr:?}: {e}"))
            })?
            .next()
            .ok_or_else(|| {
                ServerError::invalid(format!("listen_address {addr:?} resolved to nothing"))
            })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
    }

    /// The worker-pool slice of this configuration.
    pub fn to_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers: self.worker_count,
            queue_bound: self.queue_bound,
            backpressure_mode: self.backpressure_mode,
            backpressure_timeout_ms: self.backpressure_timeout_ms,
            stack_size: self.worker_stack_size,
            thread_name_prefix: self.thread_name_prefix.clone(),
        }
    }

    /// Render as YAML (used by `check-config`).
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ServerError::invalid(e.to_string()))
    }
}

/// Accepts `8192` or `0x2000` for a stack size given on the command line.
pub fn parse_stack_size(s: &str) -> std::result::Result<usize, String> {
    parse_size(s).ok_or_else(|| format!("invalid size: {s}"))
}
