//! Task wait counters: the fan-in primitive behind `wait`.
//!
//! A counter knows how many children were created into it (`count`) and how
//! many finished, tallied per worker so completions never contend on one
//! cache line. A wait is satisfied exactly when the tallies sum to `count`.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Fan-in counter for one parent task (or the top level).
#[derive(Debug)]
pub struct TaskWaitCounter {
    count: AtomicUsize,
    tally: Box<[CachePadded<AtomicUsize>]>,
    pass: AtomicU64,
}

impl TaskWaitCounter {
    /// Creates a counter with one tally slot per worker.
    pub fn new(num_workers: usize) -> Self {
        TaskWaitCounter {
            count: AtomicUsize::new(0),
            tally: (0..num_workers.max(1))
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
            pass: AtomicU64::new(0),
        }
    }

    /// Registers one more child. Called before the child is scheduled.
    pub fn add_child(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Records that a child finished on `worker`.
    ///
    /// The Release pairs with the Acquire loads in [`TaskWaitCounter::completed`],
    /// making the child's side effects visible to the waiter.
    pub fn complete(&self, worker: usize) {
        self.tally[worker].fetch_add(1, Ordering::Release);
    }

    /// Children created since the last satisfied wait.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Sum of the per-worker tallies.
    pub fn completed(&self) -> usize {
        self.tally.iter().map(|slot| slot.load(Ordering::Acquire)).sum()
    }

    pub fn is_satisfied(&self) -> bool {
        self.completed() == self.count()
    }

    /// Number of waits satisfied so far.
    pub fn pass(&self) -> u64 {
        self.pass.load(Ordering::Relaxed)
    }

    /// Ends the current epoch if every registered child finished.
    ///
    /// On success the observed completions are subtracted from the tallies
    /// and from `count`, leaving only children created concurrently with the
    /// check, and the pass number advances. Tallies are lowered before
    /// `count` so that `sum(tally) <= count` holds throughout.
    pub fn try_finish(&self) -> bool {
        let count = self.count();
        if count == 0 {
            return true;
        }

        let snapshot: Vec<usize> = self
            .tally
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect();
        let done: usize = snapshot.iter().sum();
        if done != count || self.count() != count {
            return false;
        }

        for (slot, seen) in self.tally.iter().zip(snapshot) {
            if seen > 0 {
                slot.fetch_sub(seen, Ordering::AcqRel);
            }
        }
        self.count.fetch_sub(count, Ordering::AcqRel);
        self.pass.fetch_add(1, Ordering::Relaxed);
        true
    }
}
