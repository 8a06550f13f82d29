//! Bounded two-lock FIFO queue.
//!
//! Producers serialize on the enqueue lock, consumers on the dequeue lock, so
//! a concurrent push and pop never contend. The occupancy counter is atomic:
//! [`Queue::size`] is lock-free and only a hint under concurrent use.

use crate::lock::Lock;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default capacity of every task queue.
pub const DEFAULT_CAPACITY: usize = 4096;

pub struct Queue<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    head: Lock<usize>,
    tail: Lock<usize>,
    size: AtomicUsize,
}

// SAFETY: a slot is written only by the holder of the enqueue lock while the
// slot is free, and read only by the holder of the dequeue lock while it is
// occupied. Ownership of the element moves between those two sides through
// the Release/Acquire pair on `size`.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Creates a queue holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Queue {
            slots: (0..capacity).map(|_| UnsafeCell::new(None)).collect(),
            head: Lock::new(0),
            tail: Lock::new(0),
            size: AtomicUsize::new(0),
        }
    }

    /// Appends `item`, handing it back if the queue is at capacity.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut tail = self.tail.lock();
        if self.size.load(Ordering::Acquire) >= self.slots.len() {
            return Err(item);
        }

        let idx = *tail;
        // SAFETY: size < capacity, so the slot at `tail` has been released by
        // the consumer side and no one else holds the enqueue lock.
        unsafe {
            *self.slots[idx].get() = Some(item);
        }
        *tail = (idx + 1) % self.slots.len();
        self.size.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Removes the oldest element.
    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.lock();
        if self.size.load(Ordering::Acquire) == 0 {
            return None;
        }

        let idx = *head;
        // SAFETY: size > 0, so the slot at `head` was published by a producer
        // and no one else holds the dequeue lock.
        let item = unsafe { (*self.slots[idx].get()).take() };
        *head = (idx + 1) % self.slots.len();
        self.size.fetch_sub(1, Ordering::Release);
        item
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
