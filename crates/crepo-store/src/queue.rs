use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Bounded FIFO shared between threads without caller-side locking.
///
/// Backs the writable claim pool, the per-container reclaim bins, the
/// tracker's destruction queue and the per-container archived-file queue.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Enqueue without blocking. Hands the item back if the queue is full.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, waiting up to `timeout` for room.
    pub fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        while items.len() >= self.capacity {
            if self.not_full.wait_until(&mut items, deadline).timed_out()
                && items.len() >= self.capacity
            {
                return Err(item);
            }
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn poll(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Remove up to `max` items, waiting up to `timeout` for the first one.
    pub fn drain_timeout(&self, max: usize, timeout: Duration) -> Vec<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        while items.is_empty() {
            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                break;
            }
        }
        let n = items.len().min(max);
        let drained: Vec<T> = items.drain(..n).collect();
        drop(items);
        if !drained.is_empty() {
            self.not_full.notify_all();
        }
        drained
    }

    pub fn clear(&self) {
        self.items.lock().clear();
        self.not_full.notify_all();
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Clone of the head without removing it.
    pub fn peek(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
