//! Bounded hand-off between a frame reader and the detector.
//!
//! When the detector falls behind, [`FrameQueue::push`] evicts the oldest
//! queued frame so the detector always works on recent data.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, QueueError>;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Bounded multi-producer, multi-consumer queue with drop-oldest overflow.
pub struct FrameQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue without blocking, evicting the oldest item when full.
    ///
    /// Returns the evicted item, if any.
    pub fn push(&self, item: T) -> Result<Option<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let evicted = if state.items.len() >= self.capacity {
            state.dropped += 1;
            state.items.pop_front()
        } else {
            None
        };
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(evicted)
    }

    /// Enqueue, waiting for space instead of evicting.
    pub fn push_blocking(&self, item: T) -> Result<()> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue, blocking until an item arrives. `None` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Dequeue, giving up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock();
        if state.items.is_empty() && !state.closed {
            self.not_empty.wait_for(&mut state, timeout);
        }
        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Refuse further pushes and wake all waiters. Queued items can still
    /// be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Items evicted by [`push`](Self::push) so far.
    pub fn dropped_count(&self) -> u64 {
        self.state.lock().dropped
    }
}
