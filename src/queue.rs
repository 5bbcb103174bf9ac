//! # Connection Queue
//!
//! FIFO handoff between the acceptor and the worker threads.
//!
//! The queue carries [`Entry`] values: either a unit of work or a
//! [`Entry::Sentinel`] telling the worker that pops it to exit. Any number of
//! threads may push and pop concurrently; every entry is delivered to exactly
//! one consumer, in insertion order.
//!
//! ## Bounding
//!
//! By default the queue is unbounded and `push` never blocks. With
//! [`QueueBound::Bounded`] the acceptor gets backpressure: `push` blocks while
//! the queue is at capacity, and `push_timeout` / `try_push` hand the item
//! back instead. Sentinels always bypass the bound so shutdown can never
//! wait on a full queue.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A queued unit: real work, or the signal to exit.
#[derive(Debug, PartialEq, Eq)]
pub enum Entry<T> {
    /// Work for a worker.
    Item(T),
    /// "No more work" - the worker that pops this must stop popping.
    Sentinel,
}

/// Capacity policy for a [`ConnectionQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBound {
    /// Never blocks producers.
    #[default]
    Unbounded,
    /// Producers block (or get the item back) once this many items are queued.
    Bounded(usize),
}

impl QueueBound {
    /// Map an optional configured capacity to a bound.
    pub fn from_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(n) => QueueBound::Bounded(n),
            None => QueueBound::Unbounded,
        }
    }

    fn is_full(self, items: usize) -> bool {
        match self {
            QueueBound::Unbounded => false,
            QueueBound::Bounded(cap) => items >= cap,
        }
    }
}

/// Result of a non-blocking or deadline-bounded push.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum PushOutcome<T> {
    /// The item is in the queue.
    Queued,
    /// The queue stayed full; ownership of the item is returned to the caller.
    Full(T),
}

struct State<T> {
    entries: VecDeque<Entry<T>>,
    // Sentinels don't count against the bound.
    items: usize,
}

/// Thread-safe FIFO of [`Entry`] values.
pub struct ConnectionQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    bound: QueueBound,
}

impl<T> ConnectionQueue<T> {
    /// Create an unbounded queue.
    pub fn unbounded() -> Self {
        Self::new(QueueBound::Unbounded)
    }

    /// Create a queue with the given capacity policy.
    ///
    /// A `Bounded(0)` bound is treated as `Bounded(1)`; configuration
    /// validation rejects zero before it gets here.
    pub fn new(bound: QueueBound) -> Self {
        let bound = match bound {
            QueueBound::Bounded(0) => QueueBound::Bounded(1),
            other => other,
        };
        Self {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                items: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            bound,
        }
    }

    /// The capacity policy this queue was built with.
    pub fn bound(&self) -> QueueBound {
        self.bound
    }

    /// Append `item`, blocking while a bounded queue is full.
    pub fn push(&self, item: T) {
        let mut state = self.state.lock();
        while self.bound.is_full(state.items) {
            self.not_full.wait(&mut state);
        }
        Self::enqueue(&mut state, item);
        drop(state);
        self.not_empty.notify_one();
    }

    /// Append `item`, waiting at most `timeout` for space in a bounded queue.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> PushOutcome<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while self.bound.is_full(state.items) {
            if self.not_full.wait_until(&mut state, deadline).timed_out()
                && self.bound.is_full(state.items)
            {
                return PushOutcome::Full(item);
            }
        }
        Self::enqueue(&mut state, item);
        drop(state);
        self.not_empty.notify_one();
        PushOutcome::Queued
    }

    /// Append `item` only if there is room right now.
    pub fn try_push(&self, item: T) -> PushOutcome<T> {
        let mut state = self.state.lock();
        if self.bound.is_full(state.items) {
            return PushOutcome::Full(item);
        }
        Self::enqueue(&mut state, item);
        drop(state);
        self.not_empty.notify_one();
        PushOutcome::Queued
    }

    /// Append a sentinel. Ignores the bound and never blocks.
    pub fn push_sentinel(&self) {
        self.state.lock().entries.push_back(Entry::Sentinel);
        self.not_empty.notify_one();
    }

    /// Remove and return the head entry, blocking until one is available.
    pub fn pop(&self) -> Entry<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.entries.pop_front() {
                if matches!(entry, Entry::Item(_)) {
                    state.items -= 1;
                    drop(state);
                    self.not_full.notify_one();
                }
                return entry;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Number of queued work items (sentinels excluded). Approximate by the
    /// time the caller looks at it.
    pub fn len(&self) -> usize {
        self.state.lock().items
    }

    /// `true` when no work items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enqueue(state: &mut State<T>, item: T) {
        state.entries.push_back(Entry::Item(item));
        state.items += 1;
    }
}

impl<T> Default for ConnectionQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> std::fmt::Debug for ConnectionQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionQueue")
            .field("bound", &self.bound)
            .field("items", &self.len())
            .finish_non_exhaustive()
    }
}
