//! Fixed-capacity Chase-Lev work-stealing deque.
//!
//! The owner pushes and pops at the bottom; any thread may steal from the top.
//! `top` only moves forward through a successful compare-and-swap. Indices are
//! signed so that the transient `bottom < top` state seen during a race reads
//! as empty instead of wrapping around.
//!
//! Elements are boxed and their pointers published through atomic slots, so a
//! stealer racing with the owner never performs a torn read: ownership of the
//! pointed-to element is only assumed by whoever wins the CAS on `top`.

use crossbeam::deque::Steal;
use crossbeam::utils::CachePadded;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering, fence};

pub struct Dequeue<T> {
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    slots: Box<[AtomicPtr<T>]>,
    mask: usize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: elements only ever move between threads by value, and the
// owner/stealer protocol hands each element to exactly one thread.
unsafe impl<T: Send> Send for Dequeue<T> {}
unsafe impl<T: Send> Sync for Dequeue<T> {}

impl<T> Dequeue<T> {
    /// Creates a deque whose capacity is `capacity` rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Dequeue {
            top: CachePadded::new(AtomicIsize::new(0)),
            bottom: CachePadded::new(AtomicIsize::new(0)),
            slots: (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            mask: capacity - 1,
            _marker: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: isize) -> &AtomicPtr<T> {
        &self.slots[(index as usize) & self.mask]
    }

    /// Pushes `item` at the bottom, handing it back when the deque is full.
    ///
    /// # Safety
    ///
    /// Must only be called by the single owner thread, never concurrently
    /// with [`Dequeue::push_bottom`] or [`Dequeue::pop_bottom`] on another thread.
    pub unsafe fn push_bottom(&self, item: T) -> Result<(), T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b - t >= self.capacity() as isize {
            return Err(item);
        }

        let raw = Box::into_raw(Box::new(item));
        self.slot(b).store(raw, Ordering::Relaxed);
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Pops the most recently pushed element.
    ///
    /// # Safety
    ///
    /// Same contract as [`Dequeue::push_bottom`]: owner thread only.
    pub unsafe fn pop_bottom(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Empty: undo the reservation.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let raw = self.slot(b).load(Ordering::Relaxed);
        if t < b {
            // SAFETY: more than one element remains, stealers cannot reach `b`.
            return Some(unsafe { *Box::from_raw(raw) });
        }

        // Last element: race the stealers for it.
        let won = self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b + 1, Ordering::Relaxed);
        if won {
            // SAFETY: the CAS on `top` transferred ownership to us.
            Some(unsafe { *Box::from_raw(raw) })
        } else {
            None
        }
    }

    /// Steals the oldest element.
    ///
    /// Returns [`Steal::Retry`] when another thread won the race for the same
    /// slot; the caller decides whether to try again.
    pub fn steal(&self) -> Steal<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return Steal::Empty;
        }

        let raw = self.slot(t).load(Ordering::Relaxed);
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Retry;
        }
        // SAFETY: winning the CAS on `top` makes this thread the only owner of
        // the element published at index `t`.
        Steal::Success(unsafe { *Box::from_raw(raw) })
    }

    /// Cheap emptiness hint; may be stale by the time the caller acts on it.
    pub fn looks_empty(&self) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        b <= t
    }

    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Dequeue<T> {
    fn drop(&mut self) {
        let t = *self.top.get_mut();
        let b = *self.bottom.get_mut();
        for index in t..b {
            let raw = self.slot(index).load(Ordering::Relaxed);
            if !raw.is_null() {
                // SAFETY: elements in [top, bottom) were pushed and never taken.
                unsafe { drop(Box::from_raw(raw)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_owner_lifo_and_capacity() {
        let dq = Dequeue::new(4);
        assert_eq!(dq.capacity(), 4);
        unsafe {
            for i in 0..4 {
                assert!(dq.push_bottom(i).is_ok());
            }
            assert_eq!(dq.push_bottom(99), Err(99));
            assert_eq!(dq.pop_bottom(), Some(3));
            assert_eq!(dq.pop_bottom(), Some(2));
        }
        assert_eq!(dq.len(), 2);
    }

    #[test]
    fn test_steal_takes_oldest() {
        let dq = Dequeue::new(8);
        unsafe {
            dq.push_bottom("a").expect("room");
            dq.push_bottom("b").expect("room");
        }
        assert!(matches!(dq.steal(), Steal::Success("a")));
        assert!(matches!(dq.steal(), Steal::Success("b")));
        assert!(matches!(dq.steal(), Steal::Empty));
        assert!(dq.looks_empty());
        assert_eq!(unsafe { dq.pop_bottom() }, None);
    }

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(Dequeue::<u8>::new(0).capacity(), 2);
        assert_eq!(Dequeue::<u8>::new(5).capacity(), 8);
        assert_eq!(Dequeue::<u8>::new(4096).capacity(), 4096);
    }

    #[test]
    fn test_drop_releases_remaining() {
        let marker = Arc::new(());
        {
            let dq = Dequeue::new(8);
            unsafe {
                for _ in 0..5 {
                    dq.push_bottom(marker.clone()).expect("room");
                }
                dq.pop_bottom();
            }
            let _ = dq.steal();
            assert_eq!(Arc::strong_count(&marker), 4);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_last_element_race() {
        for _ in 0..200 {
            let dq = Arc::new(Dequeue::new(2));
            unsafe { dq.push_bottom(7usize).expect("room") };
            let taken = Arc::new(AtomicUsize::new(0));

            let thief = {
                let dq = dq.clone();
                let taken = taken.clone();
                thread::spawn(move || {
                    loop {
                        match dq.steal() {
                            Steal::Success(_) => {
                                taken.fetch_add(1, Ordering::SeqCst);
                                break;
                            }
                            Steal::Retry => continue,
                            Steal::Empty => break,
                        }
                    }
                })
            };
            if unsafe { dq.pop_bottom() }.is_some() {
                taken.fetch_add(1, Ordering::SeqCst);
            }
            thief.join().expect("thief panicked");
            assert_eq!(taken.load(Ordering::SeqCst), 1);
        }
    }
}
