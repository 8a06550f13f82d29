//! `ws`: one FIFO queue per worker, steal round-robin when the own queue is dry.

use super::{Popped, Push, SchedulingPolicy, round_robin};
use crate::queue::Queue;
use crate::task::Task;
use crate::worker::Seat;

pub struct WorkStealing {
    queues: Box<[Queue<Box<Task>>]>,
}

impl WorkStealing {
    pub fn new(workers: usize, capacity: usize) -> Self {
        WorkStealing {
            queues: (0..workers).map(|_| Queue::new(capacity)).collect(),
        }
    }
}

impl SchedulingPolicy for WorkStealing {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn push(&self, seat: &Seat, task: Box<Task>) -> Push {
        match self.queues[seat.id()].push(task) {
            Ok(()) => Push::Enqueued,
            Err(task) => Push::Full(task),
        }
    }

    fn pop(&self, seat: &Seat) -> Option<Popped> {
        if let Some(task) = self.queues[seat.id()].pop() {
            return Some(Popped::owned(task));
        }
        round_robin(seat.id(), self.queues.len())
            .filter(|&victim| !self.queues[victim].is_empty())
            .find_map(|victim| self.queues[victim].pop())
            .map(|task| Popped::stolen(task, None))
    }

    fn len(&self) -> usize {
        self.queues.iter().map(Queue::size).sum()
    }

    fn capacity(&self) -> usize {
        self.queues.first().map_or(0, Queue::capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::fixtures::task;

    #[test]
    fn test_own_queue_first() {
        let policy = WorkStealing::new(3, 8);
        let w0 = Seat::new(0, 0, 0);
        let w1 = Seat::new(1, 1, 0);
        assert!(matches!(policy.push(&w0, task(1)), Push::Enqueued));
        assert!(matches!(policy.push(&w1, task(2)), Push::Enqueued));

        let popped = policy.pop(&w1).unwrap();
        assert_eq!(popped.task.id().as_u64(), 2);
        assert!(!popped.stolen);

        let popped = policy.pop(&w1).unwrap();
        assert_eq!(popped.task.id().as_u64(), 1);
        assert!(popped.stolen);
        assert!(policy.pop(&w1).is_none());
    }

    #[test]
    fn test_victims_in_round_robin_order() {
        let policy = WorkStealing::new(4, 8);
        for worker in [0, 3] {
            let seat = Seat::new(worker, worker, 0);
            assert!(matches!(
                policy.push(&seat, task(worker as u64 + 10)),
                Push::Enqueued
            ));
        }
        // Worker 2 looks at 3 before wrapping around to 0.
        let thief = Seat::new(2, 2, 0);
        assert_eq!(policy.pop(&thief).unwrap().task.id().as_u64(), 13);
        assert_eq!(policy.pop(&thief).unwrap().task.id().as_u64(), 10);
        assert_eq!(policy.len(), 0);
    }
}
