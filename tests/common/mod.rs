#![allow(dead_code)]

pub mod test_server {
    use poolserver::{ConnectionHandler, Server, ServerConfig};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    /// Poll interval used by test servers; keeps shutdown latency low.
    pub const POLL_INTERVAL_MS: u64 = 100;

    /// A loopback config on a free port with a short poll interval.
    pub fn test_config(workers: usize) -> ServerConfig {
        let mut config = ServerConfig::new("127.0.0.1:0", workers);
        config.shutdown_poll_interval_ms = POLL_INTERVAL_MS;
        config
    }

    /// A started server whose accept loop runs on a background thread.
    pub struct RunningServer {
        pub server: Arc<Server>,
        runner: Option<JoinHandle<poolserver::Result<()>>>,
    }

    impl RunningServer {
        pub fn start<H: ConnectionHandler>(config: ServerConfig, handler: H) -> Self {
            let server = Server::builder(config).handler(handler).build().unwrap();
            Self::from_server(server)
        }

        pub fn from_server(server: Server) -> Self {
            let server = Arc::new(server);
            server.start().unwrap();
            let runner = {
                let server = Arc::clone(&server);
                thread::spawn(move || server.serve_forever())
            };
            Self {
                server,
                runner: Some(runner),
            }
        }

        pub fn addr(&self) -> std::net::SocketAddr {
            self.server.local_addr().unwrap()
        }

        /// Request a stop and wait for `serve_forever` to finish shutting down.
        pub fn stop(mut self) -> Arc<Server> {
            self.server.request_stop();
            self.join();
            Arc::clone(&self.server)
        }

        fn join(&mut self) {
            if let Some(runner) = self.runner.take() {
                runner.join().unwrap().unwrap();
            }
        }
    }

    impl Drop for RunningServer {
        fn drop(&mut self) {
            self.server.request_stop();
            if let Some(runner) = self.runner.take() {
                drop(runner.join());
            }
        }
    }

    /// Poll `cond` until it holds or `timeout` passes.
    pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }
}

pub mod handlers {
    use poolserver::{Connection, ServerContext};
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    /// What a recording handler saw for one connection.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outcome {
        Handled(u32),
        Errored(u32),
    }

    /// Shared log of connection indices, filled in by [`recording_handler`].
    #[derive(Clone, Default)]
    pub struct Recorder {
        pub outcomes: Arc<Mutex<Vec<Outcome>>>,
    }

    impl Recorder {
        pub fn handled(&self) -> Vec<u32> {
            self.outcomes
                .lock()
                .unwrap()
                .iter()
                .filter_map(|o| match o {
                    Outcome::Handled(i) => Some(*i),
                    Outcome::Errored(_) => None,
                })
                .collect()
        }

        pub fn errored(&self) -> Vec<u32> {
            self.outcomes
                .lock()
                .unwrap()
                .iter()
                .filter_map(|o| match o {
                    Outcome::Errored(i) => Some(*i),
                    Outcome::Handled(_) => None,
                })
                .collect()
        }

        pub fn len(&self) -> usize {
            self.outcomes.lock().unwrap().len()
        }
    }

    /// Reads the connection's index (one decimal line sent by the client)
    /// and records it. Indices in `fail_on` make the handler return an error
    /// after recording it as errored.
    pub fn recording_handler(
        recorder: Recorder,
        fail_on: &'static [u32],
    ) -> impl Fn(&mut Connection, &ServerContext) -> anyhow::Result<()> + Send + Sync + 'static {
        move |conn: &mut Connection, _ctx: &ServerContext| {
            let index = read_index(conn)?;
            if fail_on.contains(&index) {
                recorder
                    .outcomes
                    .lock()
                    .unwrap()
                    .push(Outcome::Errored(index));
                anyhow::bail!("handler refused connection #{index}");
            }
            recorder
                .outcomes
                .lock()
                .unwrap()
                .push(Outcome::Handled(index));
            Ok(())
        }
    }

    pub fn read_index(conn: &mut Connection) -> anyhow::Result<u32> {
        let mut line = String::new();
        conn.read_to_string(&mut line)?;
        Ok(line.trim().parse()?)
    }
}

pub mod client {
    use std::io::{ErrorKind, Read, Write};
    use std::net::{Shutdown, SocketAddr, TcpStream};
    use std::time::Duration;

    /// Connect, send `index` and half-close, then wait for the server to
    /// close its side. Returns whatever the server wrote.
    pub fn send_index(addr: SocketAddr, index: u32) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut out = Vec::new();
        // The server may close (rejected or shed) before we finish sending.
        let sent = writeln!(stream, "{index}").and_then(|()| stream.shutdown(Shutdown::Write));
        if let Err(e) = sent {
            assert!(is_closed_by_peer(&e), "send to connection #{index} failed: {e}");
            return out;
        }
        if let Err(e) = stream.read_to_end(&mut out) {
            // A reset (server closed with unread input) still counts as closed.
            assert!(
                !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                "server never closed connection #{index}"
            );
        }
        out
    }

    fn is_closed_by_peer(e: &std::io::Error) -> bool {
        matches!(
            e.kind(),
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::NotConnected
        )
    }
}
