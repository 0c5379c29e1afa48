use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Bounded FIFO shared between pipeline stages
///
/// When full, `push_latest` evicts the oldest item so producers never block:
/// the pipeline prefers fresh frames over complete ones.
pub struct FrameBuffer<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> FrameBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Insert only if there is room; a full buffer hands `item` back
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.available.notify_one();
        Ok(())
    }

    /// Insert, evicting the oldest item if the buffer is full.
    ///
    /// Returns the evicted item so the caller can count the drop.
    pub fn push_latest(&self, item: T) -> Option<T> {
        let mut items = self.items.lock();
        let evicted = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        drop(items);
        self.available.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait up to `timeout` for an item
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();
        if items.is_empty() {
            // Spurious wakeups just fall through to another empty check.
            self.available.wait_for(&mut items, timeout);
        }
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything currently queued
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}
