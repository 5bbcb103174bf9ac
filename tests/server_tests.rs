//! Integration tests for the server lifecycle over real loopback TCP
//!
//! # Test Coverage
//!
//! - Delivery: every accepted connection reaches exactly one worker
//! - Isolation: handler errors and panics never take a worker down
//! - Shutdown: prompt, idempotent, drains queued connections, joins workers
//! - Bind failures surface as `ServerError::Bind`
//! - Admission: verifier rejection, bounded queue in block and shed modes
//!
//! # Test Strategy
//!
//! Each test starts its own server on `127.0.0.1:0` with a 100ms poll
//! interval (see `common::test_server`). Clients write a decimal index,
//! half-close, and wait for the server to close; the recording handler logs
//! which indices it saw.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::client::send_index;
use common::handlers::{read_index, recording_handler, Recorder};
use common::test_server::{test_config, wait_until, RunningServer};
use poolserver::worker_pool::BackpressureMode;
use poolserver::{Connection, Server, ServerConfig, ServerContext, ServerError, ServerState};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// One-shot gate handlers can wait on.
#[derive(Clone, Default)]
struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    fn open(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

#[test]
fn test_all_connections_handled_exactly_once() {
    // Scenario A: 3 workers, 10 connections.
    let recorder = Recorder::default();
    let running = RunningServer::start(test_config(3), recording_handler(recorder.clone(), &[]));
    let addr = running.addr();

    let clients: Vec<_> = (0..10)
        .map(|i| thread::spawn(move || send_index(addr, i)))
        .collect();
    for c in clients {
        c.join().unwrap();
    }

    let server = running.stop();
    let mut handled = recorder.handled();
    handled.sort_unstable();
    assert_eq!(handled, (0..10).collect::<Vec<_>>());
    assert_eq!(server.metrics().handled(), 10);
    assert_eq!(server.metrics().snapshot().accepted, 10);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn test_failing_handler_does_not_stop_worker() {
    // Scenario B: one worker, connection #3 fails.
    let recorder = Recorder::default();
    let running = RunningServer::start(test_config(1), recording_handler(recorder.clone(), &[3]));
    let addr = running.addr();

    for i in 1..=5 {
        send_index(addr, i);
    }
    assert_eq!(recorder.handled(), vec![1, 2, 4, 5]);
    assert_eq!(recorder.errored(), vec![3]);

    // The single worker is still alive and keeps serving.
    send_index(addr, 6);
    assert!(wait_until(Duration::from_secs(5), || recorder.len() == 6));
    assert_eq!(recorder.handled(), vec![1, 2, 4, 5, 6]);

    let server = running.stop();
    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.handled, 5);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.panicked, 0);
}

#[test]
fn test_panicking_handler_does_not_stop_worker() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        move |conn: &mut Connection, _ctx: &ServerContext| -> anyhow::Result<()> {
            let index = read_index(conn)?;
            seen.lock().unwrap().push(index);
            if index == 2 {
                panic!("connection #{index} blew up");
            }
            Ok(())
        }
    };
    let running = RunningServer::start(test_config(1), handler);
    let addr = running.addr();

    for i in 1..=4 {
        send_index(addr, i);
    }

    let server = running.stop();
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.handled, 3);
    assert_eq!(snapshot.panicked, 1);
}

#[test]
fn test_shutdown_without_connections_is_prompt() {
    // Scenario C: start, then shut down straight away.
    let server = Server::builder(ServerConfig::new("127.0.0.1:0", 4))
        .handler(|_: &mut Connection, _: &ServerContext| -> anyhow::Result<()> { Ok(()) })
        .build()
        .unwrap();
    server.start().unwrap();

    let start = Instant::now();
    server.shutdown();
    assert!(start.elapsed() < server.config().poll_interval());
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn test_shutdown_interrupts_running_accept_loop() {
    // Default 2s poll interval: only the listener wake-up makes this fast.
    let server = Arc::new(
        Server::builder(ServerConfig::new("127.0.0.1:0", 2))
            .handler(|_: &mut Connection, _: &ServerContext| -> anyhow::Result<()> { Ok(()) })
            .build()
            .unwrap(),
    );
    server.start().unwrap();
    let runner = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.serve_forever())
    };
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    server.shutdown();
    runner.join().unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(server.state(), ServerState::Stopped);
}

thread_local! {
    static EXIT_MARKER: RefCell<Option<ExitMarker>> = const { RefCell::new(None) };
}

/// Counts worker threads that have exited (its destructor runs on thread exit).
struct ExitMarker(Arc<AtomicUsize>);

impl Drop for ExitMarker {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_shutdown_terminates_every_worker() {
    for workers in [1usize, 4, 8] {
        let exited = Arc::new(AtomicUsize::new(0));
        // W connections held at a barrier of W: each one lands on a different worker.
        let barrier = Arc::new(Barrier::new(workers));
        let handler = {
            let exited = Arc::clone(&exited);
            let barrier = Arc::clone(&barrier);
            move |conn: &mut Connection, _ctx: &ServerContext| -> anyhow::Result<()> {
                read_index(conn)?;
                EXIT_MARKER.with(|marker| {
                    marker
                        .borrow_mut()
                        .get_or_insert_with(|| ExitMarker(Arc::clone(&exited)));
                });
                barrier.wait();
                Ok(())
            }
        };
        let running = RunningServer::start(test_config(workers), handler);
        let addr = running.addr();

        let clients: Vec<_> = (0..workers as u32)
            .map(|i| thread::spawn(move || send_index(addr, i)))
            .collect();
        for c in clients {
            c.join().unwrap();
        }
        assert_eq!(exited.load(Ordering::SeqCst), 0);

        let server = running.stop();
        assert_eq!(exited.load(Ordering::SeqCst), workers, "workers = {workers}");
        assert_eq!(server.metrics().handled(), workers as u64);
    }
}

#[test]
fn test_shutdown_is_idempotent() {
    let running = RunningServer::start(
        test_config(2),
        recording_handler(Recorder::default(), &[]),
    );
    let server = Arc::clone(&running.server);

    // Two concurrent callers plus the accept loop's own shutdown.
    let a = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.shutdown())
    };
    server.shutdown();
    a.join().unwrap();
    server.shutdown();
    assert_eq!(server.state(), ServerState::Stopped);

    let server = running.stop();
    server.shutdown();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn test_second_server_on_same_address_fails_to_bind() {
    let first = Server::builder(test_config(1))
        .handler(|_: &mut Connection, _: &ServerContext| -> anyhow::Result<()> { Ok(()) })
        .build()
        .unwrap();
    first.start().unwrap();
    let addr = first.local_addr().unwrap();

    let second = Server::builder(ServerConfig {
        listen_address: addr.to_string(),
        ..test_config(1)
    })
    .handler(|_: &mut Connection, _: &ServerContext| -> anyhow::Result<()> { Ok(()) })
    .build()
    .unwrap();

    match second.start() {
        Err(ServerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
        other => panic!("expected Bind error, got {other:?}"),
    }
    assert_eq!(second.state(), ServerState::NotStarted);

    first.shutdown();
}

#[test]
fn test_address_reusable_after_drop() {
    let server = Server::builder(test_config(1))
        .handler(|_: &mut Connection, _: &ServerContext| -> anyhow::Result<()> { Ok(()) })
        .build()
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    drop(server);

    let again = Server::builder(ServerConfig {
        listen_address: addr.to_string(),
        ..test_config(1)
    })
    .handler(|_: &mut Connection, _: &ServerContext| -> anyhow::Result<()> { Ok(()) })
    .build()
    .unwrap();
    again.start().unwrap();
    assert_eq!(again.local_addr(), Some(addr));
}

#[test]
fn test_verifier_rejects_before_queueing() {
    let recorder = Recorder::default();
    let seen = Arc::new(AtomicUsize::new(0));
    let server = Server::builder(test_config(2))
        .handler(recording_handler(recorder.clone(), &[]))
        .verifier({
            let seen = Arc::clone(&seen);
            // Admit every other connection.
            move |_: &Connection| seen.fetch_add(1, Ordering::SeqCst) % 2 == 0
        })
        .build()
        .unwrap();
    let running = RunningServer::from_server(server);
    let addr = running.addr();

    for i in 0..6 {
        send_index(addr, i);
    }

    let server = running.stop();
    let mut handled = recorder.handled();
    handled.sort_unstable();
    assert_eq!(handled, vec![0, 2, 4]);
    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.accepted, 6);
    assert_eq!(snapshot.rejected, 3);
    assert_eq!(snapshot.handled, 3);
}

/// Handler that reports each start on `started` and then waits for `gate`.
fn gated_handler(
    started: Arc<AtomicUsize>,
    gate: Gate,
) -> impl Fn(&mut Connection, &ServerContext) -> anyhow::Result<()> + Send + Sync + 'static {
    move |conn: &mut Connection, _ctx: &ServerContext| {
        read_index(conn)?;
        started.fetch_add(1, Ordering::SeqCst);
        gate.wait();
        Ok(())
    }
}

fn bounded_config(mode: BackpressureMode) -> ServerConfig {
    let mut config = test_config(1);
    config.queue_bound = Some(1);
    config.backpressure_mode = mode;
    config.backpressure_timeout_ms = 20;
    config
}

#[test]
fn test_shed_mode_drops_connections_when_full() {
    let started = Arc::new(AtomicUsize::new(0));
    let gate = Gate::default();
    let running = RunningServer::start(
        bounded_config(BackpressureMode::Shed),
        gated_handler(Arc::clone(&started), gate.clone()),
    );
    let addr = running.addr();
    let metrics = Arc::clone(running.server.metrics());

    // #0 occupies the only worker, #1 fills the queue.
    let c0 = thread::spawn(move || send_index(addr, 0));
    assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 1));
    let c1 = thread::spawn(move || send_index(addr, 1));
    assert!(wait_until(Duration::from_secs(5), || metrics.queue_depth() == 1));

    // #2 finds the queue full and is closed by the acceptor.
    send_index(addr, 2);
    assert_eq!(metrics.snapshot().shed, 1);

    gate.open();
    c0.join().unwrap();
    c1.join().unwrap();

    let server = running.stop();
    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.accepted, 3);
    assert_eq!(snapshot.shed, 1);
    assert_eq!(snapshot.handled, 2);
}

#[test]
fn test_block_mode_waits_for_space() {
    let started = Arc::new(AtomicUsize::new(0));
    let gate = Gate::default();
    let running = RunningServer::start(
        bounded_config(BackpressureMode::Block),
        gated_handler(Arc::clone(&started), gate.clone()),
    );
    let addr = running.addr();
    let metrics = Arc::clone(running.server.metrics());

    let c0 = thread::spawn(move || send_index(addr, 0));
    assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 1));
    let c1 = thread::spawn(move || send_index(addr, 1));
    assert!(wait_until(Duration::from_secs(5), || metrics.queue_depth() == 1));
    // #2 is accepted, then the acceptor waits for room.
    let c2 = thread::spawn(move || send_index(addr, 2));
    assert!(wait_until(Duration::from_secs(5), || metrics.snapshot().accepted == 3));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(metrics.snapshot().shed, 0);

    gate.open();
    for c in [c0, c1, c2] {
        c.join().unwrap();
    }

    let server = running.stop();
    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.handled, 3);
    assert_eq!(snapshot.shed, 0);
}

#[test]
fn test_stop_while_acceptor_blocked_drains_queue() {
    let started = Arc::new(AtomicUsize::new(0));
    let gate = Gate::default();
    let running = RunningServer::start(
        bounded_config(BackpressureMode::Block),
        gated_handler(Arc::clone(&started), gate.clone()),
    );
    let addr = running.addr();
    let server = Arc::clone(&running.server);
    let metrics = Arc::clone(server.metrics());

    let c0 = thread::spawn(move || send_index(addr, 0));
    assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 1));
    let c1 = thread::spawn(move || send_index(addr, 1));
    assert!(wait_until(Duration::from_secs(5), || metrics.queue_depth() == 1));
    let c2 = thread::spawn(move || send_index(addr, 2));
    assert!(wait_until(Duration::from_secs(5), || metrics.snapshot().accepted == 3));

    // The waiting connection is given up; the queued one is still served.
    server.request_stop();
    assert!(wait_until(Duration::from_secs(5), || metrics.snapshot().shed == 1));
    gate.open();
    for c in [c0, c1, c2] {
        c.join().unwrap();
    }

    let server = running.stop();
    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.handled, 2);
    assert_eq!(snapshot.shed, 1);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn test_handler_sees_context_and_can_stop_server() {
    let handler = |conn: &mut Connection, ctx: &ServerContext| -> anyhow::Result<()> {
        let index = read_index(conn)?;
        writeln!(conn, "{} {}", ctx.worker_count(), ctx.local_addr())?;
        if index == 99 {
            ctx.stop_handle().request_stop();
        }
        Ok(())
    };
    let server = Arc::new(Server::builder(test_config(3)).handler(handler).build().unwrap());
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let runner = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.serve_forever())
    };

    let reply = String::from_utf8(send_index(addr, 1)).unwrap();
    assert_eq!(reply.trim(), format!("3 {addr}"));

    send_index(addr, 99);
    runner.join().unwrap().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.metrics().handled(), 2);
}

#[test]
fn test_connections_refused_after_shutdown() {
    let running = RunningServer::start(
        test_config(1),
        recording_handler(Recorder::default(), &[]),
    );
    let addr = running.addr();
    send_index(addr, 0);
    let _server = running.stop();

    let refused = match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
        Err(_) => true,
        // Some stacks accept into a dead backlog; the read then fails or hits EOF.
        Ok(mut s) => {
            let mut buf = [0u8; 1];
            !matches!(s.read(&mut buf), Ok(n) if n > 0)
        }
    };
    assert!(refused);
}
