//! Lock-free counters shared by the acceptor, the workers and handlers.
//!
//! All counters use `Ordering::Relaxed`: they are monitoring data, and no
//! control flow depends on them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters for one server instance.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    shed: AtomicU64,
    transient_accept_errors: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    queue_depth: AtomicUsize,
}

/// Point-in-time copy of [`ServerMetrics`], suitable for logging or JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub shed: u64,
    pub transient_accept_errors: u64,
    pub handled: u64,
    pub failed: u64,
    pub panicked: u64,
    pub queue_depth: usize,
}

impl ServerMetrics {
    /// Create metrics with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection came out of `accept`.
    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// The verifier refused a connection before it reached a worker.
    pub fn record_reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// The queue was full and the connection was dropped.
    pub fn record_shed(&self) {
        self.shed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_accept_error(&self) {
        self.transient_accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection entered the queue.
    pub fn record_enqueue(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker took a connection off the queue.
    pub fn record_dequeue(&self) {
        // Saturate rather than wrap if a caller dequeues without a matching enqueue.
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        while current > 0 {
            match self.queue_depth.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Handler returned `Ok`.
    pub fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    /// Handler returned `Err`.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Handler panicked.
    pub fn record_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            transient_accept_errors: self.transient_accept_errors.load(Ordering::Relaxed),
            handled: self.handled(),
            failed: self.failed(),
            panicked: self.panicked(),
            queue_depth: self.queue_depth(),
        }
    }
}
