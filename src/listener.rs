//! # Listener Module
//!
//! Owns the listening socket and provides an `accept` with a bounded wait.
//!
//! ## Overview
//!
//! The accept loop must be interruptible: it has to notice a stop request
//! within one poll interval without any self-connect trick. The listener
//! therefore runs in non-blocking mode and waits for readiness with a
//! [`polling::Poller`], which gives us:
//!
//! - a timeout on every wait ([`Listener::accept_with_timeout`])
//! - a cross-thread wake-up ([`ListenerWaker::wake`]) so `request_stop` takes
//!   effect immediately instead of at the next timeout
//!
//! Outcomes are reported as a tagged [`AcceptOutcome`]; a timeout is an
//! expected result, not an error.
//!
//! ## Socket Setup
//!
//! The socket is built with `socket2` so `SO_REUSEADDR` is set *before*
//! `bind` (a restarted server does not trip over a TIME_WAIT socket) and the
//! listen backlog is explicit. Windows is the exception: there
//! `SO_REUSEADDR` lets a second socket steal an active port, so it is left off.

use crate::error::{Result, ServerError};
use polling::{Event, Poller};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const LISTENER_KEY: usize = 0;

/// Failure of a single accept attempt.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// Per-connection failure (peer reset before accept completed, fd
    /// exhaustion, ...). The loop should continue.
    #[error("transient accept error: {0}")]
    Transient(#[source] io::Error),
    /// The listening socket itself is unusable. The loop should exit.
    #[error("fatal accept error: {0}")]
    Fatal(#[source] io::Error),
}

impl AcceptError {
    /// Sort an I/O error from `accept` into transient or fatal.
    pub fn classify(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
            | OutOfMemory => AcceptError::Transient(err),
            _ if err.raw_os_error().is_some_and(is_resource_exhaustion) => {
                AcceptError::Transient(err)
            }
            _ => AcceptError::Fatal(err),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AcceptError::Fatal(_))
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(code: i32) -> bool {
    matches!(
        code,
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_code: i32) -> bool {
    false
}

/// Result of [`Listener::accept_with_timeout`].
#[derive(Debug)]
pub enum AcceptOutcome {
    /// A new connection, already switched back to blocking mode.
    Accepted(TcpStream, SocketAddr),
    /// Nothing arrived within the timeout (or the waker fired).
    TimedOut,
    /// The accept attempt failed.
    Failed(AcceptError),
}

/// Interrupts a [`Listener`] that is waiting inside `accept_with_timeout`.
///
/// Cheap to clone and usable from any thread, including signal-listener
/// threads.
#[derive(Clone)]
pub struct ListenerWaker {
    poller: Arc<Poller>,
}

impl ListenerWaker {
    pub fn wake(&self) {
        if let Err(e) = self.poller.notify() {
            debug!(error = %e, "listener wake-up failed");
        }
    }
}

impl std::fmt::Debug for ListenerWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerWaker").finish_non_exhaustive()
    }
}

/// The listening socket plus its readiness poller.
pub struct Listener {
    socket: Option<TcpListener>,
    poller: Arc<Poller>,
    local_addr: SocketAddr,
    events: Vec<Event>,
}

impl Listener {
    /// Create, configure, bind and listen on `addr`.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if any step of socket setup fails (address in
    /// use, permission denied, ...), [`ServerError::Io`] if the poller
    /// cannot be created.
    pub fn bind_and_listen(addr: SocketAddr, backlog: i32) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| bind_error(addr, e))?;
        #[cfg(not(windows))]
        socket
            .set_reuse_address(true)
            .map_err(|e| bind_error(addr, e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| bind_error(addr, e))?;
        socket.listen(backlog).map_err(|e| bind_error(addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| bind_error(addr, e))?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        let poller = Poller::new()?;
        poller.add(&listener, Event::readable(LISTENER_KEY))?;

        info!(addr = %local_addr, backlog, "listening");

        Ok(Self {
            socket: Some(listener),
            poller: Arc::new(poller),
            local_addr,
            events: Vec::new(),
        })
    }

    /// The bound address (useful after binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    pub fn waker(&self) -> ListenerWaker {
        ListenerWaker {
            poller: Arc::clone(&self.poller),
        }
    }

    /// Wait at most `timeout` for an incoming connection.
    pub fn accept_with_timeout(&mut self, timeout: Duration) -> AcceptOutcome {
        let Some(socket) = self.socket.as_ref() else {
            return AcceptOutcome::Failed(AcceptError::Fatal(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener is closed",
            )));
        };

        // Drain the backlog without touching the poller when we can.
        if let Some(outcome) = try_accept(socket) {
            return outcome;
        }

        // Readiness interest is one-shot; re-arm before every wait.
        if let Err(e) = self.poller.modify(socket, Event::readable(LISTENER_KEY)) {
            return AcceptOutcome::Failed(AcceptError::Fatal(e));
        }

        self.events.clear();
        match self.poller.wait(&mut self.events, Some(timeout)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return AcceptOutcome::TimedOut,
            Err(e) => return AcceptOutcome::Failed(AcceptError::Fatal(e)),
        }

        if self.events.iter().all(|ev| ev.key != LISTENER_KEY) {
            // Timed out, or woken by `ListenerWaker`.
            return AcceptOutcome::TimedOut;
        }

        try_accept(socket).unwrap_or(AcceptOutcome::TimedOut)
    }

    /// Release the listening socket. Idempotent.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            if let Err(e) = self.poller.delete(&socket) {
                debug!(error = %e, "failed to deregister listener");
            }
            drop(socket);
            info!(addr = %self.local_addr, "listener closed");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// One non-blocking accept. `None` means "nothing pending".
fn try_accept(socket: &TcpListener) -> Option<AcceptOutcome> {
    match socket.accept() {
        Ok((stream, peer)) => Some(match stream.set_nonblocking(false) {
            Ok(()) => AcceptOutcome::Accepted(stream, peer),
            Err(e) => AcceptOutcome::Failed(AcceptError::Transient(e)),
        }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
        Err(e) => Some(AcceptOutcome::Failed(AcceptError::classify(e))),
    }
}

fn bind_error(addr: SocketAddr, source: io::Error) -> ServerError {
    ServerError::Bind { addr, source }
}
