//! # Worker Pool Module
//!
//! A fixed-size pool of OS threads consuming one shared [`ConnectionQueue`].
//!
//! ## Features
//!
//! - **Fixed Size**: exactly `num_workers` workers, spawned once by [`WorkerPool::start`];
//!   never elastic
//! - **Shared Queue**: all workers pop from the same FIFO, so load balances itself
//! - **Backpressure**: with a bounded queue, [`WorkerPool::dispatch`] either pauses the
//!   producer ([`BackpressureMode::Block`]) or hands the item back to be dropped
//!   ([`BackpressureMode::Shed`])
//! - **Deterministic Shutdown**: one sentinel per live worker, then join every thread
//!
//! ## Configuration
//!
//! - `POOLSRV_WORKERS`: Number of worker threads (default: 4)
//! - `POOLSRV_QUEUE_BOUND`: Queue capacity; unset means unbounded
//! - `POOLSRV_BACKPRESSURE_MODE`: `block` or `shed` (default: `block`)
//! - `POOLSRV_BACKPRESSURE_TIMEOUT_MS`: How long one blocking dispatch waits (default: 50)
//! - `POOLSRV_STACK_SIZE`: Worker thread stack size, decimal or `0x` hex (default: OS default)

use crate::error::{Result, ServerError};
use crate::metrics::ServerMetrics;
use crate::queue::{ConnectionQueue, PushOutcome, QueueBound};
use crate::worker::{panic_message, Processor, Worker, WorkerSpawn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What to do with new work when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Wait for space (with a timeout per attempt), pausing the producer
    #[default]
    Block,
    /// Give the item back immediately so the caller can drop it
    Shed,
}

impl BackpressureMode {
    /// Parse backpressure mode from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "block" => Some(Self::Block),
            "shed" => Some(Self::Shed),
            _ => None,
        }
    }
}

/// Configuration for a worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Maximum queue depth (`None` = unbounded)
    pub queue_bound: Option<usize>,
    /// Backpressure mode, only relevant with a bounded queue
    pub backpressure_mode: BackpressureMode,
    /// Timeout for one blocking dispatch attempt in milliseconds
    pub backpressure_timeout_ms: u64,
    /// Stack size for worker threads (`None` = platform default)
    pub stack_size: Option<usize>,
    /// Worker threads are named `{prefix}-{index}`
    pub thread_name_prefix: String,
}

impl WorkerPoolConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields that have a corresponding environment variable set
    pub fn apply_env(&mut self) {
        if let Some(n) = env_parse("POOLSRV_WORKERS", |s| s.parse().ok()) {
            self.num_workers = n;
        }
        if let Some(bound) = env_parse("POOLSRV_QUEUE_BOUND", |s| s.parse().ok()) {
            self.queue_bound = Some(bound);
        }
        if let Some(mode) = env_parse("POOLSRV_BACKPRESSURE_MODE", BackpressureMode::from_str) {
            self.backpressure_mode = mode;
        }
        if let Some(ms) = env_parse("POOLSRV_BACKPRESSURE_TIMEOUT_MS", |s| s.parse().ok()) {
            self.backpressure_timeout_ms = ms;
        }
        if let Some(size) = env_parse("POOLSRV_STACK_SIZE", parse_size) {
            self.stack_size = Some(size);
        }
    }

    /// Create a custom configuration
    pub fn new(
        num_workers: usize,
        queue_bound: Option<usize>,
        backpressure_mode: BackpressureMode,
        backpressure_timeout_ms: u64,
        stack_size: Option<usize>,
    ) -> Self {
        Self {
            num_workers,
            queue_bound,
            backpressure_mode,
            backpressure_timeout_ms,
            stack_size,
            ..Self::default()
        }
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_bound: None,
            backpressure_mode: BackpressureMode::Block,
            backpressure_timeout_ms: 50,
            stack_size: None,
            thread_name_prefix: "poolsrv-worker".to_string(),
        }
    }
}

/// Parse a size given in decimal or `0x`-prefixed hex.
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

pub(crate) fn env_parse<V>(key: &str, parse: impl FnOnce(&str) -> Option<V>) -> Option<V> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring unparseable environment override");
    }
    parsed
}

/// Result of handing one item to the pool
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum Dispatch<T> {
    /// The item is queued for a worker
    Queued,
    /// Block mode: the queue stayed full for one backpressure timeout. The
    /// caller decides whether to retry or give up.
    Waiting(T),
    /// Shed mode: the queue is full and the item was not queued
    Shed(T),
}

/// A fixed-size pool of worker threads sharing one queue
pub struct WorkerPool<T: Send + 'static> {
    config: WorkerPoolConfig,
    queue: Arc<ConnectionQueue<T>>,
    workers: Vec<Worker>,
    metrics: Arc<ServerMetrics>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool with its queue. No threads run until [`start`](Self::start).
    pub fn new(config: WorkerPoolConfig, metrics: Arc<ServerMetrics>) -> Self {
        let queue = Arc::new(ConnectionQueue::new(QueueBound::from_capacity(
            config.queue_bound,
        )));
        Self {
            config,
            queue,
            workers: Vec::new(),
            metrics,
        }
    }

    /// Spawn `config.num_workers` workers running `processor`.
    ///
    /// # Errors
    ///
    /// - [`ServerError::InvalidConfiguration`] if `num_workers == 0`
    /// - [`ServerError::Io`] if a thread cannot be spawned; workers spawned
    ///   before the failure are shut down first
    ///
    /// Calling `start` while workers are running is a no-op.
    pub fn start<P: Processor<T>>(&mut self, processor: P) -> Result<()> {
        let n = self.config.num_workers;
        if n == 0 {
            return Err(ServerError::invalid("worker count must be greater than zero"));
        }
        if self.is_running() {
            debug!(
                num_workers = self.workers.len(),
                "worker pool already running, ignoring start"
            );
            return Ok(());
        }

        info!(
            num_workers = n,
            queue_bound = ?self.config.queue_bound,
            backpressure_mode = ?self.config.backpressure_mode,
            stack_size = ?self.config.stack_size,
            "Starting worker pool"
        );

        let processor: Arc<dyn Processor<T>> = Arc::new(processor);
        let spawn = WorkerSpawn {
            name_prefix: self.config.thread_name_prefix.clone(),
            stack_size: self.config.stack_size,
        };
        self.workers.reserve(n);

        for worker_id in 0..n {
            match Worker::spawn(
                worker_id,
                &spawn,
                Arc::clone(&self.queue),
                Arc::clone(&processor),
                Arc::clone(&self.metrics),
            ) {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to spawn worker thread");
                    self.shutdown();
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Hand an item to the workers, honouring the backpressure mode.
    pub fn dispatch(&self, item: T) -> Dispatch<T> {
        self.metrics.record_enqueue();
        let outcome = match self.config.backpressure_mode {
            BackpressureMode::Block => {
                match self.queue.push_timeout(item, self.config.backpressure_timeout()) {
                    PushOutcome::Queued => Dispatch::Queued,
                    PushOutcome::Full(item) => Dispatch::Waiting(item),
                }
            }
            BackpressureMode::Shed => match self.queue.try_push(item) {
                PushOutcome::Queued => Dispatch::Queued,
                PushOutcome::Full(item) => Dispatch::Shed(item),
            },
        };
        if !matches!(outcome, Dispatch::Queued) {
            self.metrics.record_dequeue();
        }
        outcome
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// Pushes exactly one sentinel per live worker, then joins them all.
    /// Entries queued before the sentinels are still processed. Safe to call
    /// repeatedly; a pool with no workers returns immediately.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        let live = self.workers.len();
        info!(num_workers = live, "Shutting down worker pool");
        for _ in 0..live {
            self.queue.push_sentinel();
        }

        for worker in self.workers.drain(..) {
            let worker_id = worker.id();
            if let Err(payload) = worker.join() {
                // Handler panics are caught inside the loop; this is a panic
                // in the loop itself.
                error!(
                    worker_id,
                    panic_message = panic_message(payload.as_ref()),
                    "Worker thread panicked"
                );
            }
        }
        debug!("worker pool stopped");
    }

    /// Number of live workers
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// The shared queue (producers may push to it directly)
    pub fn queue(&self) -> &Arc<ConnectionQueue<T>> {
        &self.queue
    }

    /// Get metrics for this worker pool
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
