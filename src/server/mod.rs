//! # Server Module
//!
//! The composition root: one [`Listener`](crate::listener::Listener), one
//! [`WorkerPool`](crate::worker_pool::WorkerPool) of connections, and the
//! accept loop that connects them.
//!
//! ## Lifecycle
//!
//! ```text
//! NotStarted --start()--> Listening --shutdown()--> Stopped
//!      \___________________shutdown()_________________/
//! ```
//!
//! [`Server::serve_forever`] runs the accept loop on the calling thread. Each
//! wait on the listener lasts at most `shutdown_poll_interval_ms`; a
//! [`StopHandle::request_stop`] also wakes it immediately. Shutdown stops
//! accepting first, then enqueues one sentinel per worker, so every
//! connection accepted before the stop is handled.

mod handler;
#[allow(clippy::module_inception)]
mod server;

pub use handler::{ConnectionHandler, RequestVerifier, ServerContext, StopHandle};
pub use server::{Server, ServerBuilder, ServerState};
