//! # CLI Module
//!
//! Command-line interface for the `poolserver` binary.
//!
//! ## Commands
//!
//! ### `serve`
//!
//! Start the server and run it until SIGINT or SIGTERM:
//!
//! ```bash
//! poolserver serve --addr 0.0.0.0:7000 --workers 8
//! ```
//!
//! Options:
//! - `--config <FILE>` - YAML (or `.toml`) configuration file; also `POOLSRV_CONFIG`
//! - `--addr <HOST:PORT>` - Listen address (default: `127.0.0.1:8080`)
//! - `--workers <N>` - Worker threads (default: 4)
//! - `--poll-interval-ms <MS>` - Accept wait per iteration (default: 2000)
//! - `--queue-bound <N>` - Bound the connection queue
//! - `--backpressure <block|shed>` - Behaviour when a bounded queue is full
//! - `--stack-size <BYTES>` - Worker stack size
//! - `--handler <echo|discard>` - Built-in handler (default: echo)
//!
//! Flags override `POOLSRV_*` environment variables, which override the
//! config file. On exit the final metrics snapshot is printed as JSON.
//!
//! ### `check-config`
//!
//! ```bash
//! poolserver check-config --config server.yaml
//! ```
//!
//! Prints the effective configuration (file plus environment) as YAML, or
//! fails with the validation error.

mod commands;


pub use commands::{load_config, run_cli, Cli, Commands, HandlerKind, ServeOverrides};
