//! Error types for the server lifecycle.
//!
//! Handler failures are not part of this enum: handlers return
//! [`anyhow::Result`], and the worker that ran them logs and drops the error.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced synchronously from server construction and lifecycle calls.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound (address in use, permission denied, ...).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address we attempted to bind.
        addr: SocketAddr,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The configuration is unusable (zero workers, missing handler, bad address).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// `start()` was called on a server that already left the `NotStarted` state.
    #[error("server already started")]
    AlreadyStarted,

    /// A lifecycle call that requires a started server was made too early.
    #[error("server not started")]
    NotStarted,

    /// A configuration file could not be read or parsed.
    #[error("failed to load config {path}: {message}")]
    Config {
        /// Path of the offending file.
        path: PathBuf,
        /// Parser or I/O error message.
        message: String,
    },

    /// Any other I/O failure (thread spawn, poller creation, ...).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ServerError::InvalidConfiguration(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ServerError>;
