//! An accepted client connection.
//!
//! A [`Connection`] has exactly one owner at a time: the acceptor until it is
//! queued, the queue while buffered, and one worker while it is processed.
//! Dropping it closes the socket, so every exit path out of a worker
//! (success, handler error, handler panic) releases it.

use crate::ids::ConnectionId;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::trace;

pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    id: ConnectionId,
    accepted_at: Instant,
}

impl Connection {
    /// Wrap a freshly accepted stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            id: ConnectionId::new(),
            accepted_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Time since the acceptor took this connection off the listen backlog.
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Shut down both directions and release the socket.
    ///
    /// A peer that already went away (`NotConnected`) is not an error.
    pub fn close(self) -> io::Result<()> {
        trace!(connection_id = %self.id, peer = %self.peer_addr, "closing connection");
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}
