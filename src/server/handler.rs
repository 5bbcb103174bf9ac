//! Handler-facing types: what a handler implements and what it can see.

use crate::connection::Connection;
use crate::listener::ListenerWaker;
use crate::metrics::ServerMetrics;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Serves one accepted connection.
///
/// Called on a worker thread. The connection is closed by the server after
/// `handle` returns, whether it succeeded, failed, or panicked. An `Err` is
/// logged with its full context chain and counted; it never stops the worker.
///
/// Closures with the right signature implement this trait:
///
/// ```
/// use poolserver::{Connection, ServerContext};
/// use std::io::Write;
///
/// let hello = |conn: &mut Connection, _ctx: &ServerContext| -> anyhow::Result<()> {
///     conn.write_all(b"hello\n")?;
///     Ok(())
/// };
/// # let _ = hello;
/// ```
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, conn: &mut Connection, ctx: &ServerContext) -> anyhow::Result<()>;
}

impl<F> ConnectionHandler for F
where
    F: Fn(&mut Connection, &ServerContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, conn: &mut Connection, ctx: &ServerContext) -> anyhow::Result<()> {
        self(conn, ctx)
    }
}

/// Admission check run on the acceptor thread before a connection is queued.
/// Returning `false` closes the connection without it reaching a worker.
pub type RequestVerifier = dyn Fn(&Connection) -> bool + Send + Sync + 'static;

#[derive(Default)]
pub(crate) struct StopSignal {
    requested: AtomicBool,
    waker: Mutex<Option<ListenerWaker>>,
}

impl StopSignal {
    pub(crate) fn install_waker(&self, waker: Option<ListenerWaker>) {
        *self.waker.lock() = waker;
    }
}

/// Asks a running server to stop accepting.
///
/// Setting the flag and waking the listener is all `request_stop` does, so it
/// is safe to call from a signal-listener thread or from inside a handler.
/// The server's own thread performs the actual shutdown once its accept loop
/// notices.
#[derive(Clone, Default)]
pub struct StopHandle {
    pub(crate) signal: Arc<StopSignal>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.signal.requested.store(true, Ordering::SeqCst);
        if let Some(waker) = self.signal.waker.lock().as_ref() {
            waker.wake();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.signal.requested.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("stop_requested", &self.is_stop_requested())
            .finish()
    }
}

/// Read-only view of the server passed to every handler call.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub(crate) local_addr: SocketAddr,
    pub(crate) worker_count: usize,
    pub(crate) stop: StopHandle,
    pub(crate) metrics: Arc<ServerMetrics>,
}

impl ServerContext {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Lets a handler end the server (e.g. a `shutdown` command).
    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }
}
