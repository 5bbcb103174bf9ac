use super::handler::{ConnectionHandler, RequestVerifier, ServerContext, StopHandle};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{Result, ServerError};
use crate::listener::{AcceptError, AcceptOutcome, Listener};
use crate::metrics::ServerMetrics;
use crate::worker::panic_message;
use crate::worker_pool::{Dispatch, WorkerPool};
use anyhow::Context as _;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, debug_span, error, info, warn};

/// Pause after a transient accept failure so fd exhaustion does not spin the
/// acceptor.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Lifecycle state. Transitions only move forward:
/// `NotStarted -> Listening -> Stopped` (or `NotStarted -> Stopped`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Listening,
    Stopped,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    handler: Option<Arc<dyn ConnectionHandler>>,
    verifier: Option<Arc<RequestVerifier>>,
}

impl ServerBuilder {
    /// The handler run for every admitted connection. Required.
    pub fn handler<H: ConnectionHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Optional admission check, run on the acceptor before queuing.
    pub fn verifier<V>(mut self, verifier: V) -> Self
    where
        V: Fn(&Connection) -> bool + Send + Sync + 'static,
    {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// # Errors
    ///
    /// [`ServerError::InvalidConfiguration`] if no handler was set or the
    /// configuration fails [`ServerConfig::validate`].
    pub fn build(self) -> Result<Server> {
        let handler = self
            .handler
            .ok_or_else(|| ServerError::invalid("a connection handler is required"))?;
        self.config.validate()?;

        let metrics = Arc::new(ServerMetrics::new());
        let pool = WorkerPool::new(self.config.to_pool_config(), Arc::clone(&metrics));
        Ok(Server {
            config: self.config,
            handler,
            verifier: self.verifier,
            metrics,
            stop: StopHandle::default(),
            state: Mutex::new(ServerState::NotStarted),
            listener: Mutex::new(None),
            pool: Mutex::new(pool),
            local_addr: Mutex::new(None),
        })
    }
}

/// A TCP server that hands accepted connections to a fixed pool of worker
/// threads.
///
/// All methods take `&self`, so a server can be shared through an `Arc`:
/// one thread runs [`serve_forever`](Self::serve_forever) while another calls
/// [`shutdown`](Self::shutdown).
///
/// # Example
///
/// ```no_run
/// use poolserver::{Connection, Server, ServerConfig, ServerContext};
/// use std::io::Write;
///
/// let server = Server::builder(ServerConfig::new("127.0.0.1:8080", 4))
///     .handler(|conn: &mut Connection, _ctx: &ServerContext| -> anyhow::Result<()> {
///         conn.write_all(b"hello\n")?;
///         Ok(())
///     })
///     .build()?;
/// server.start()?;
/// server.serve_forever()?;
/// # Ok::<(), poolserver::ServerError>(())
/// ```
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn ConnectionHandler>,
    verifier: Option<Arc<RequestVerifier>>,
    metrics: Arc<ServerMetrics>,
    stop: StopHandle,
    state: Mutex<ServerState>,
    // Lock order: state, then listener, then pool.
    listener: Mutex<Option<Listener>>,
    pool: Mutex<WorkerPool<Connection>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            handler: None,
            verifier: None,
        }
    }

    /// Bind the listener and spawn the workers.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyStarted`] unless the server is `NotStarted`
    /// - [`ServerError::Bind`] if the address cannot be bound; the server
    ///   stays `NotStarted`
    /// - [`ServerError::Io`] if a worker thread cannot be spawned; the
    ///   listener is closed again
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ServerState::NotStarted {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = self.config.resolve_address()?;
        let listener = Listener::bind_and_listen(addr, self.config.listen_backlog)?;
        let local_addr = listener.local_addr();

        let ctx = Arc::new(ServerContext {
            local_addr,
            worker_count: self.config.worker_count,
            stop: self.stop.clone(),
            metrics: Arc::clone(&self.metrics),
        });
        let processor = connection_processor(Arc::clone(&self.handler), ctx);
        // Dropping `listener` on error closes it.
        self.pool.lock().start(processor)?;

        self.stop.signal.install_waker(Some(listener.waker()));
        *self.local_addr.lock() = Some(local_addr);
        *self.listener.lock() = Some(listener);
        *state = ServerState::Listening;

        info!(
            addr = %local_addr,
            workers = self.config.worker_count,
            poll_interval_ms = self.config.shutdown_poll_interval_ms,
            "server listening"
        );
        Ok(())
    }

    /// Run the accept loop until a stop is requested or accepting fails
    /// fatally, then shut down.
    ///
    /// Returns `Ok(())` immediately on a server that is already stopped.
    ///
    /// # Errors
    ///
    /// [`ServerError::NotStarted`] if [`start`](Self::start) has not succeeded.
    pub fn serve_forever(&self) -> Result<()> {
        match self.state() {
            ServerState::NotStarted => return Err(ServerError::NotStarted),
            ServerState::Stopped => return Ok(()),
            ServerState::Listening => {}
        }

        {
            let mut listener = self.listener.lock();
            if let Some(listener) = listener.as_mut() {
                let pool = self.pool.lock();
                self.accept_loop(listener, &pool);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn accept_loop(&self, listener: &mut Listener, pool: &WorkerPool<Connection>) {
        let poll_interval = self.config.poll_interval();
        debug!(addr = %listener.local_addr(), "accept loop started");

        while !self.stop.is_stop_requested() {
            match listener.accept_with_timeout(poll_interval) {
                AcceptOutcome::Accepted(stream, peer) => {
                    self.metrics.record_accept();
                    self.admit(pool, Connection::new(stream, peer));
                }
                AcceptOutcome::TimedOut => {}
                AcceptOutcome::Failed(err) => {
                    if self.on_accept_failure(err).is_break() {
                        break;
                    }
                }
            }
        }

        debug!("accept loop finished");
    }

    /// Transient failures are counted and backed off; fatal ones end the loop.
    fn on_accept_failure(&self, err: AcceptError) -> ControlFlow<()> {
        match err {
            AcceptError::Transient(e) => {
                self.metrics.record_transient_accept_error();
                warn!(error = %e, "transient accept error, continuing");
                thread::sleep(ACCEPT_ERROR_BACKOFF);
                ControlFlow::Continue(())
            }
            AcceptError::Fatal(e) => {
                error!(error = %e, "listener failed, leaving accept loop");
                ControlFlow::Break(())
            }
        }
    }

    /// Verify and enqueue one accepted connection.
    fn admit(&self, pool: &WorkerPool<Connection>, conn: Connection) {
        if let Some(verifier) = &self.verifier {
            let allowed = match panic::catch_unwind(AssertUnwindSafe(|| verifier(&conn))) {
                Ok(allowed) => allowed,
                Err(payload) => {
                    error!(
                        connection_id = %conn.id(),
                        panic_message = panic_message(payload.as_ref()),
                        "verifier panicked, rejecting connection"
                    );
                    false
                }
            };
            if !allowed {
                self.metrics.record_reject();
                debug!(connection_id = %conn.id(), peer = %conn.peer_addr(), "connection rejected");
                close_quietly(conn);
                return;
            }
        }

        let mut conn = conn;
        let mut retries = 0u32;
        loop {
            match pool.dispatch(conn) {
                Dispatch::Queued => return,
                Dispatch::Waiting(waiting) => {
                    if self.stop.is_stop_requested() {
                        self.shed(waiting);
                        return;
                    }
                    if retries == 0 {
                        warn!(
                            connection_id = %waiting.id(),
                            queue_len = pool.queue().len(),
                            "queue full, acceptor waiting for a free worker"
                        );
                    } else {
                        debug!(connection_id = %waiting.id(), retries, "queue still full");
                    }
                    retries = retries.saturating_add(1);
                    conn = waiting;
                }
                Dispatch::Shed(shed) => {
                    self.shed(shed);
                    return;
                }
            }
        }
    }

    fn shed(&self, conn: Connection) {
        self.metrics.record_shed();
        warn!(connection_id = %conn.id(), peer = %conn.peer_addr(), "queue full, connection shed");
        close_quietly(conn);
    }

    /// Stop accepting, drain the queue, and join every worker.
    ///
    /// Idempotent and callable from any thread except a worker (a worker
    /// would wait on its own join); handlers use
    /// [`StopHandle::request_stop`] instead. Connections queued before the
    /// call are still handled. On a `NotStarted` server this only moves the
    /// state to `Stopped`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        match *state {
            ServerState::Stopped => return,
            ServerState::NotStarted => {
                *state = ServerState::Stopped;
                return;
            }
            ServerState::Listening => {}
        }

        info!("server shutting down");
        self.stop.request_stop();

        // Waits for a running accept loop to exit; nothing is accepted after this.
        if let Some(mut listener) = self.listener.lock().take() {
            listener.close();
        }
        self.stop.signal.install_waker(None);

        // Sentinels go in behind every connection already queued.
        self.pool.lock().shutdown();

        let snapshot = self.metrics.snapshot();
        info!(
            accepted = snapshot.accepted,
            rejected = snapshot.rejected,
            shed = snapshot.shed,
            handled = snapshot.handled,
            failed = snapshot.failed,
            panicked = snapshot.panicked,
            "server stopped"
        );
        *state = ServerState::Stopped;
    }

    /// Ask the accept loop to exit; [`serve_forever`](Self::serve_forever)
    /// then completes the shutdown. Never blocks.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// A cloneable handle for requesting a stop from other threads.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// The bound address, once [`start`](Self::start) has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("workers", &self.config.worker_count)
            .finish_non_exhaustive()
    }
}

/// Wrap the handler as the pool's per-item processor: run it inside a
/// connection span, then close the socket.
fn connection_processor(
    handler: Arc<dyn ConnectionHandler>,
    ctx: Arc<ServerContext>,
) -> impl Fn(usize, Connection) -> anyhow::Result<()> + Send + Sync + 'static {
    move |worker_id, mut conn: Connection| {
        let connection_id = conn.id();
        let peer = conn.peer_addr();
        let span = debug_span!("connection", worker_id, %connection_id, %peer);
        let _enter = span.enter();

        debug!(queued_for_ms = conn.age().as_millis() as u64, "handling connection");
        let result = handler.handle(&mut conn, &ctx);
        if let Err(e) = conn.close() {
            debug!(error = %e, "error closing connection");
        }
        result.with_context(|| format!("connection {connection_id} from {peer}"))
    }
}

fn close_quietly(conn: Connection) {
    if let Err(e) = conn.close() {
        debug!(error = %e, "error closing connection");
    }
}
