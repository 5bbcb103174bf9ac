//! # poolserver
//!
//! **poolserver** is a bounded worker-pool TCP server: one acceptor thread
//! feeds accepted connections into a FIFO queue drained by a fixed number of
//! OS worker threads, and shutdown is deterministic.
//!
//! ## Overview
//!
//! - The accept loop waits at most one poll interval per call, so a stop
//!   request is noticed promptly (and immediately, thanks to a listener waker).
//! - Workers block on the queue; a handler error or panic is logged and
//!   counted, and the worker moves on to the next connection.
//! - Shutdown stops accepting, enqueues exactly one sentinel per worker behind
//!   any queued connections, and joins every worker.
//! - The queue may be bounded, with a choice of blocking the acceptor or
//!   shedding new connections when it is full.
//!
//! ## Architecture
//!
//! - **[`queue`]** - MPMC FIFO of connections and shutdown sentinels
//! - **[`worker`]** - One worker thread's loop
//! - **[`worker_pool`]** - Fixed-size pool, dispatch with backpressure, sentinel shutdown
//! - **[`listener`]** - Socket setup and `accept` with a bounded, wakeable wait
//! - **[`connection`]** - An accepted client socket with its id and peer address
//! - **[`server`]** - Lifecycle state machine and the accept loop
//! - **[`config`]** - `ServerConfig`: file, environment and validation
//! - **[`logging`]** - `tracing` subscriber setup for the binary
//! - **[`metrics`]** - Atomic counters and JSON snapshots
//!
//! ### Request Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Acceptor as Server::serve_forever
//!     participant Queue as ConnectionQueue
//!     participant Worker
//!     participant Handler as ConnectionHandler
//!
//!     Client->>Acceptor: TCP connect
//!     Acceptor->>Acceptor: accept_with_timeout(poll_interval)
//!     Acceptor->>Acceptor: verifier(&conn)
//!     Acceptor->>Queue: dispatch(conn)
//!     Worker->>Queue: pop()
//!     Queue-->>Worker: Entry::Item(conn)
//!     Worker->>Handler: handle(&mut conn, &ctx)
//!     Handler-->>Client: response bytes
//!     Worker->>Client: close
//! ```
//!
//! ### Shutdown Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Caller
//!     participant Server
//!     participant Listener
//!     participant Queue
//!     participant Workers
//!
//!     Caller->>Server: shutdown()
//!     Server->>Listener: set stop flag + wake
//!     Server->>Listener: wait for accept loop, close
//!     Server->>Queue: push_sentinel() x W
//!     Workers->>Queue: drain queued connections
//!     Workers->>Queue: pop Sentinel, exit
//!     Server->>Workers: join all
//!     Server-->>Caller: Stopped
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use poolserver::{Connection, Server, ServerConfig, ServerContext};
//! use std::io::Write;
//!
//! fn greet(conn: &mut Connection, _ctx: &ServerContext) -> anyhow::Result<()> {
//!     let peer = conn.peer_addr();
//!     writeln!(conn, "hello {peer}")?;
//!     Ok(())
//! }
//!
//! let server = Server::builder(ServerConfig::new("127.0.0.1:8080", 4))
//!     .handler(greet)
//!     .build()?;
//! server.start()?;
//!
//! let stop = server.stop_handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(30));
//!     stop.request_stop();
//! });
//!
//! server.serve_forever()?;
//! # Ok::<(), poolserver::ServerError>(())
//! ```
//!
//! ## Binary
//!
//! ```bash
//! poolserver serve --addr 0.0.0.0:7000 --workers 8 --handler echo
//! poolserver serve --config server.yaml --queue-bound 64 --backpressure shed
//! poolserver check-config --config server.yaml
//! ```
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod cli;
pub mod config;
pub mod connection;
mod echo;
pub mod error;
pub mod ids;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod worker;
pub mod worker_pool;

pub use config::ServerConfig;
pub use connection::Connection;
pub use echo::{discard_handler, echo_handler};
pub use error::{Result, ServerError};
pub use ids::ConnectionId;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::{
    ConnectionHandler, RequestVerifier, Server, ServerBuilder, ServerContext, ServerState,
    StopHandle,
};
