//! A single long-lived worker thread.
//!
//! The worker's only suspension point is [`ConnectionQueue::pop`]. Each item
//! it pops is handed to a [`Processor`]; errors and panics are logged and
//! counted, never propagated, and the loop moves on to the next entry. A
//! popped [`Entry::Sentinel`] ends the loop for good.

use crate::metrics::ServerMetrics;
use crate::queue::{ConnectionQueue, Entry};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Work performed for each dequeued item.
pub trait Processor<T>: Send + Sync + 'static {
    fn process(&self, worker_id: usize, item: T) -> anyhow::Result<()>;
}

impl<T, F> Processor<T> for F
where
    F: Fn(usize, T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn process(&self, worker_id: usize, item: T) -> anyhow::Result<()> {
        self(worker_id, item)
    }
}

/// Handle to a running worker thread.
pub struct Worker {
    id: usize,
    thread: JoinHandle<()>,
}

/// How a worker thread is spawned.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSpawn {
    pub name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Worker {
    pub(crate) fn spawn<T: Send + 'static>(
        id: usize,
        spawn: &WorkerSpawn,
        queue: Arc<ConnectionQueue<T>>,
        processor: Arc<dyn Processor<T>>,
        metrics: Arc<ServerMetrics>,
    ) -> io::Result<Self> {
        let mut builder = thread::Builder::new().name(format!("{}-{}", spawn.name_prefix, id));
        if let Some(size) = spawn.stack_size {
            builder = builder.stack_size(size);
        }
        let thread = builder.spawn(move || run(id, &queue, processor.as_ref(), &metrics))?;
        Ok(Self { id, thread })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Wait for the thread to exit.
    pub(crate) fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

fn run<T: 'static>(
    worker_id: usize,
    queue: &ConnectionQueue<T>,
    processor: &dyn Processor<T>,
    metrics: &ServerMetrics,
) {
    debug!(worker_id, "worker started");

    loop {
        let item = match queue.pop() {
            Entry::Sentinel => break,
            Entry::Item(item) => item,
        };
        metrics.record_dequeue();
        trace!(worker_id, "worker processing item");

        // The item moves into the closure; it is dropped (and a connection
        // closed) whether the processor returns or unwinds.
        match panic::catch_unwind(AssertUnwindSafe(|| processor.process(worker_id, item))) {
            Ok(Ok(())) => metrics.record_handled(),
            Ok(Err(e)) => {
                metrics.record_failed();
                error!(worker_id, error = format!("{e:#}"), "handler failed");
            }
            Err(payload) => {
                metrics.record_panicked();
                error!(
                    worker_id,
                    panic_message = panic_message(payload.as_ref()),
                    "handler panicked"
                );
            }
        }
    }

    debug!(worker_id, "worker received sentinel, exiting");
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
