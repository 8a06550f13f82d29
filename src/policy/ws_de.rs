//! `ws-de` and `ws-de-node`: one chase-lev deque per worker.
//!
//! The owner pushes and pops at the bottom of its deque; thieves steal from
//! the top. `ws-de` visits victims round-robin. `ws-de-node` visits workers
//! on its own node first, then nodes by increasing hop distance.

use super::{Popped, Push, SchedulingPolicy, round_robin};
use crate::dequeue::Dequeue;
use crate::task::Task;
use crate::topology::{Arch, WorkerMap};
use crate::worker::Seat;
use crossbeam::deque::Steal;
use tracing::error;

pub struct WorkStealingDeque {
    deques: Box<[Dequeue<Box<Task>>]>,
    topology: Option<(Arch, WorkerMap)>,
}

impl WorkStealingDeque {
    pub fn new(workers: usize, capacity: usize) -> Self {
        WorkStealingDeque {
            deques: (0..workers).map(|_| Dequeue::new(capacity)).collect(),
            topology: None,
        }
    }

    /// The `ws-de-node` flavor: steal victims ordered by topology.
    pub fn by_node(arch: Arch, map: WorkerMap, capacity: usize) -> Self {
        let mut policy = WorkStealingDeque::new(map.num_workers(), capacity);
        policy.topology = Some((arch, map));
        policy
    }

    fn steal_from(&self, victim: usize) -> Option<Box<Task>> {
        let deque = &self.deques[victim];
        while !deque.looks_empty() {
            match deque.steal() {
                Steal::Success(task) => match claimed(task) {
                    Some(task) => return Some(task),
                    None => continue,
                },
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
        None
    }

    fn steal_by_node(&self, seat: &Seat, arch: &Arch, map: &WorkerMap) -> Option<Popped> {
        let node = seat.node();
        let local = round_robin(seat.id(), self.deques.len())
            .filter(|&victim| map.node_of(victim) == node)
            .find_map(|victim| self.steal_from(victim));
        if let Some(task) = local {
            return Some(Popped::stolen(task, None));
        }

        for distance in 1..=arch.diameter() {
            for &remote in arch.vicinity(node, distance) {
                let found = map
                    .workers_on(remote)
                    .iter()
                    .find_map(|&victim| self.steal_from(victim));
                if let Some(task) = found {
                    return Some(Popped::stolen(task, Some(distance)));
                }
            }
        }
        None
    }
}

/// Marks a task taken by the thread that just removed it from a deque.
///
/// `None` if another thread already took it. That thread owns the task, so
/// this handle must be neither run nor freed.
fn claimed(task: Box<Task>) -> Option<Box<Task>> {
    if task.claim() {
        return Some(task);
    }
    error!(task = %task.id(), "task handed out twice, skipping");
    std::mem::forget(task);
    None
}

impl SchedulingPolicy for WorkStealingDeque {
    fn name(&self) -> &'static str {
        if self.topology.is_some() {
            "ws-de-node"
        } else {
            "ws-de"
        }
    }

    fn push(&self, seat: &Seat, task: Box<Task>) -> Push {
        // SAFETY: a seat exists only on its worker's thread, so this thread
        // is the single owner of deque `seat.id()`.
        match unsafe { self.deques[seat.id()].push_bottom(task) } {
            Ok(()) => Push::Enqueued,
            Err(task) => Push::Full(task),
        }
    }

    fn pop(&self, seat: &Seat) -> Option<Popped> {
        let own = &self.deques[seat.id()];
        if !own.looks_empty() {
            // SAFETY: see `push`.
            if let Some(task) = unsafe { own.pop_bottom() }.and_then(claimed) {
                return Some(Popped::owned(task));
            }
        }

        match &self.topology {
            Some((arch, map)) => self.steal_by_node(seat, arch, map),
            None => round_robin(seat.id(), self.deques.len())
                .find_map(|victim| self.steal_from(victim))
                .map(|task| Popped::stolen(task, None)),
        }
    }

    fn len(&self) -> usize {
        self.deques.iter().map(Dequeue::len).sum()
    }

    fn capacity(&self) -> usize {
        self.deques.first().map_or(0, Dequeue::capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::fixtures::task;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_owner_lifo_thief_fifo() {
        let policy = WorkStealingDeque::new(2, 8);
        let owner = Seat::new(0, 0, 0);
        for id in 1..=3 {
            assert!(matches!(policy.push(&owner, task(id)), Push::Enqueued));
        }

        let thief = Seat::new(1, 1, 0);
        let stolen = policy.pop(&thief).unwrap();
        assert!(stolen.stolen);
        assert_eq!(stolen.task.id().as_u64(), 1);

        let own = policy.pop(&owner).unwrap();
        assert!(!own.stolen);
        assert_eq!(own.task.id().as_u64(), 3);
        assert_eq!(policy.len(), 1);
    }

    #[test]
    fn test_full_deque() {
        let policy = WorkStealingDeque::new(1, 2);
        let owner = Seat::new(0, 0, 0);
        assert!(matches!(policy.push(&owner, task(1)), Push::Enqueued));
        assert!(matches!(policy.push(&owner, task(2)), Push::Enqueued));
        assert!(matches!(policy.push(&owner, task(3)), Push::Full(_)));
    }

    #[test]
    fn test_taken_task_is_skipped() {
        let policy = WorkStealingDeque::new(2, 8);
        let owner = Seat::new(0, 0, 0);
        let thief = Seat::new(1, 1, 0);

        let taken = task(1);
        assert!(taken.claim());
        assert!(matches!(policy.push(&owner, taken), Push::Enqueued));
        assert!(matches!(policy.push(&owner, task(2)), Push::Enqueued));
        // The thief reaches the taken task first and moves on past it.
        assert_eq!(policy.pop(&thief).unwrap().task.id().as_u64(), 2);
        assert!(policy.pop(&owner).is_none());

        let taken = task(3);
        assert!(taken.claim());
        assert!(matches!(policy.push(&owner, task(4)), Push::Enqueued));
        assert!(matches!(policy.push(&owner, taken), Push::Enqueued));
        assert!(policy.pop(&owner).is_none());
        assert_eq!(policy.pop(&owner).unwrap().task.id().as_u64(), 4);
    }

    #[test]
    fn test_node_order() {
        // Two nodes, two workers each.
        let arch = Arch::builder("fixture", 2).cores_per_node(2).build();
        let map = WorkerMap::identity(&arch, 4);
        let policy = WorkStealingDeque::by_node(arch, map, 8);
        assert_eq!(policy.name(), "ws-de-node");

        let w1 = Seat::new(1, 1, 0);
        let w2 = Seat::new(2, 2, 1);
        assert!(matches!(policy.push(&w2, task(20)), Push::Enqueued));
        assert!(matches!(policy.push(&w1, task(10)), Push::Enqueued));

        // Worker 0 prefers its node-mate over the closer-by-id remote worker.
        let w0 = Seat::new(0, 0, 0);
        let popped = policy.pop(&w0).unwrap();
        assert_eq!(popped.task.id().as_u64(), 10);
        assert_eq!(popped.distance, None);

        let popped = policy.pop(&w0).unwrap();
        assert_eq!(popped.task.id().as_u64(), 20);
        assert_eq!(popped.distance, Some(1));
        assert!(policy.pop(&w0).is_none());
    }

    #[test]
    fn test_concurrent_thieves_take_each_task_once() {
        let workers = 4;
        let total = 2000u64;
        let policy = Arc::new(WorkStealingDeque::new(workers, 4096));
        let done = Arc::new(AtomicBool::new(false));

        let thieves: Vec<_> = (1..workers)
            .map(|id| {
                let policy = policy.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let seat = Seat::new(id, id, 0);
                    let mut seen = Vec::new();
                    loop {
                        match policy.pop(&seat) {
                            Some(popped) => seen.push(popped.task.id().as_u64()),
                            None if done.load(Ordering::Acquire) && policy.is_empty() => break,
                            None => std::hint::spin_loop(),
                        }
                    }
                    seen
                })
            })
            .collect();

        let owner = Seat::new(0, 0, 0);
        let mut seen = Vec::new();
        for id in 1..=total {
            assert!(matches!(policy.push(&owner, task(id)), Push::Enqueued));
            if id % 3 == 0 {
                if let Some(popped) = policy.pop(&owner) {
                    seen.push(popped.task.id().as_u64());
                }
            }
        }
        while let Some(popped) = policy.pop(&owner) {
            seen.push(popped.task.id().as_u64());
        }
        done.store(true, Ordering::Release);
        for thief in thieves {
            seen.extend(thief.join().expect("thief panicked"));
        }

        assert_eq!(seen.len() as u64, total);
        let unique: HashSet<u64> = seen.into_iter().collect();
        assert_eq!(unique.len() as u64, total);
    }
}
