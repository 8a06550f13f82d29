//! Bounded single-lock LIFO stack.

use crate::lock::Lock;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Stack<T> {
    items: Lock<Vec<T>>,
    capacity: usize,
    size: AtomicUsize,
}

impl<T> Stack<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "stack capacity must be greater than 0");
        Stack {
            items: Lock::new(Vec::with_capacity(capacity)),
            capacity,
            size: AtomicUsize::new(0),
        }
    }

    /// Pushes `item`, handing it back if the stack is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push(item);
        self.size.store(items.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Pops the most recently pushed element.
    pub fn pop(&self) -> Option<T> {
        if self.size.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let mut items = self.items.lock();
        let item = items.pop();
        self.size.store(items.len(), Ordering::Relaxed);
        item
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
