//! `central`: every worker shares one FIFO queue.

use super::{Popped, Push, SchedulingPolicy};
use crate::queue::Queue;
use crate::task::Task;
use crate::worker::Seat;

pub struct Central {
    queue: Queue<Box<Task>>,
}

impl Central {
    pub fn new(capacity: usize) -> Self {
        Central {
            queue: Queue::new(capacity),
        }
    }
}

impl SchedulingPolicy for Central {
    fn name(&self) -> &'static str {
        "central"
    }

    fn push(&self, _seat: &Seat, task: Box<Task>) -> Push {
        match self.queue.push(task) {
            Ok(()) => Push::Enqueued,
            Err(task) => Push::Full(task),
        }
    }

    fn pop(&self, _seat: &Seat) -> Option<Popped> {
        self.queue.pop().map(Popped::owned)
    }

    fn len(&self) -> usize {
        self.queue.size()
    }

    fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::fixtures::task;

    #[test]
    fn test_fifo_across_workers() {
        let policy = Central::new(4);
        let producer = Seat::new(0, 0, 0);
        let consumer = Seat::new(1, 1, 0);
        for id in 1..=3 {
            assert!(matches!(policy.push(&producer, task(id)), Push::Enqueued));
        }
        assert_eq!(policy.len(), 3);

        let ids: Vec<u64> = std::iter::from_fn(|| policy.pop(&consumer))
            .map(|popped| {
                assert!(!popped.stolen);
                popped.task.id().as_u64()
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_full_returns_task() {
        let policy = Central::new(1);
        let seat = Seat::new(0, 0, 0);
        assert!(matches!(policy.push(&seat, task(1)), Push::Enqueued));
        match policy.push(&seat, task(2)) {
            Push::Full(task) => assert_eq!(task.id().as_u64(), 2),
            Push::Enqueued => panic!("queue accepted more than its capacity"),
        }
        assert_eq!(policy.capacity(), 1);
    }
}
