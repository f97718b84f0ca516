//! Producer/consumer synchronization primitives.
//!
//! A front-end handler enqueues a [`Message`] on a device queue, then blocks
//! on the message's [`Bell`] until the worker that served the job rings it.
//! The bell is single-use: it is bound to exactly one in-flight message and
//! returns to its reset state once the wait completes.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, LockResult, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::bbox::Prediction;

/// Key stored in a bell that nobody has rung yet.
pub const RESET: u64 = 0;
/// Key rung by a worker when a result has been written.
pub const DONE: u64 = 1;

fn relock<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// One-shot rendezvous between a request handler and a worker.
///
/// The guard key protects against spurious wakeups: `wait` returns only once
/// the stored key equals the expected one, and resets the bell on the way
/// out. `ring` stores the key and wakes the waiter; it may happen before or
/// concurrently with the wait.
pub struct Bell {
    key: Mutex<u64>,
    cv: Condvar,
}

impl Bell {
    pub fn new() -> Self {
        Self {
            key: Mutex::new(RESET),
            cv: Condvar::new(),
        }
    }

    /// Block until the bell holds `expected`, then reset it.
    pub fn wait(&self, expected: u64) {
        let mut key = relock(self.key.lock());
        while *key != expected {
            key = relock(self.cv.wait(key));
        }
        *key = RESET;
    }

    /// Store `key` and wake the waiter.
    pub fn ring(&self, key: u64) {
        {
            let mut stored = relock(self.key.lock());
            *stored = key;
        }
        self.cv.notify_all();
    }
}

impl Default for Bell {
    fn default() -> Self {
        Self::new()
    }
}

/// Unbounded FIFO channel with a blocking pop.
///
/// All operations are safe under concurrent callers; items are never
/// dropped, reordered or duplicated.
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    cv: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        {
            let mut items = relock(self.items.lock());
            items.push_back(item);
        }
        self.cv.notify_one();
    }

    /// Pop the oldest item, blocking while the queue is empty.
    pub fn pop(&self) -> T {
        let mut items = relock(self.items.lock());
        loop {
            match items.pop_front() {
                Some(item) => return item,
                None => items = relock(self.cv.wait(items)),
            }
        }
    }

    pub fn len(&self) -> usize {
        relock(self.items.lock()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Job envelope exchanged between a front end and an inference worker.
///
/// The payload and the result slot are shared with the enqueuing handler;
/// the worker writes the prediction into `result` before ringing `bell`.
pub struct Message {
    /// Encoded image payload, immutable for the duration of the job.
    pub data: Bytes,
    /// Payload size in bytes.
    pub size: usize,
    /// Slot the worker writes the prediction into.
    pub result: Arc<Mutex<Prediction>>,
    /// Rung exactly once when `result` has been written.
    pub bell: Arc<Bell>,
}

/// Queue of detection jobs for one device class.
pub type TaskQueue = BlockingQueue<Message>;

impl Message {
    /// Build a message around `data`, handing back the result slot and the
    /// bell the caller will wait on.
    pub fn new(data: Bytes) -> (Self, Arc<Mutex<Prediction>>, Arc<Bell>) {
        let result = Arc::new(Mutex::new(Prediction::new()));
        let bell = Arc::new(Bell::new());
        let size = data.len();
        let message = Self {
            data,
            size,
            result: Arc::clone(&result),
            bell: Arc::clone(&bell),
        };
        (message, result, bell)
    }
}
