//! Fixed-capacity MPMC queue with an explicit stopped state.
//!
//! The disk-read pipeline needs a queue that (a) bounds how far the
//! background reader can run ahead of the fill side and (b) can be torn
//! down from the outside while senders and receivers are blocked on it.
//! Dropping a `crossbeam_channel` sender only disconnects once every clone
//! is gone, which does not fit "interrupt now", so this is a small
//! condvar-based queue instead: `stop()` wakes everything immediately and
//! every later operation fails.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Returned by [`BoundedChannel::try_send`]; carries the rejected value back.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Stopped(T),
}

struct Shared<T> {
    queue: VecDeque<T>,
    stopped: bool,
}

pub struct BoundedChannel<T> {
    shared: Mutex<Shared<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedChannel<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be nonzero");
        Self {
            shared: Mutex::new(Shared {
                queue: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocks while the queue is full. Returns `false` if the channel is
    /// (or becomes) stopped, in which case `value` is dropped.
    pub fn send(&self, value: T) -> bool {
        let mut shared = self.shared.lock();
        while !shared.stopped && shared.queue.len() == self.capacity {
            self.not_full.wait(&mut shared);
        }
        if shared.stopped {
            return false;
        }
        shared.queue.push_back(value);
        drop(shared);
        self.not_empty.notify_one();
        true
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut shared = self.shared.lock();
        if shared.stopped {
            return Err(TrySendError::Stopped(value));
        }
        if shared.queue.len() == self.capacity {
            return Err(TrySendError::Full(value));
        }
        shared.queue.push_back(value);
        drop(shared);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks while the queue is empty. Returns `None` once stopped;
    /// items still queued at stop time are discarded, never delivered.
    pub fn recv(&self) -> Option<T> {
        let mut shared = self.shared.lock();
        while !shared.stopped && shared.queue.is_empty() {
            self.not_empty.wait(&mut shared);
        }
        if shared.stopped {
            return None;
        }
        let value = shared.queue.pop_front();
        drop(shared);
        self.not_full.notify_one();
        value
    }

    pub fn try_recv(&self) -> Option<T> {
        let mut shared = self.shared.lock();
        if shared.stopped {
            return None;
        }
        let value = shared.queue.pop_front()?;
        drop(shared);
        self.not_full.notify_one();
        Some(value)
    }

    /// Terminal: wakes every blocked sender and receiver and drops any
    /// queued items. There is no restart.
    pub fn stop(&self) {
        let mut shared = self.shared.lock();
        shared.stopped = true;
        shared.queue.clear();
        drop(shared);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }
}
