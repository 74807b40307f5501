// src/sync.rs
use std::sync::{Condvar, Mutex};

/// Counting semaphore over Mutex + Condvar.
///
/// The pool posts once per enqueued task and workers wait when the queue is
/// empty. `wait` blocks until the count is positive, then consumes one permit;
/// `post` adds a permit and wakes exactly one waiter.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        drop(count);
        self.cond.notify_one();
    }
}
