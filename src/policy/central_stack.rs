//! `central-stack`: one shared LIFO stack, so execution leans depth-first.

use super::{Popped, Push, SchedulingPolicy};
use crate::stack::Stack;
use crate::task::Task;
use crate::worker::Seat;

pub struct CentralStack {
    stack: Stack<Box<Task>>,
}

impl CentralStack {
    pub fn new(capacity: usize) -> Self {
        CentralStack {
            stack: Stack::new(capacity),
        }
    }
}

impl SchedulingPolicy for CentralStack {
    fn name(&self) -> &'static str {
        "central-stack"
    }

    fn push(&self, _seat: &Seat, task: Box<Task>) -> Push {
        match self.stack.push(task) {
            Ok(()) => Push::Enqueued,
            Err(task) => Push::Full(task),
        }
    }

    fn pop(&self, _seat: &Seat) -> Option<Popped> {
        self.stack.pop().map(Popped::owned)
    }

    fn len(&self) -> usize {
        self.stack.size()
    }

    fn capacity(&self) -> usize {
        self.stack.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::fixtures::task;

    #[test]
    fn test_most_recent_first() {
        let policy = CentralStack::new(8);
        let seat = Seat::new(0, 0, 0);
        for id in 1..=4 {
            assert!(matches!(policy.push(&seat, task(id)), Push::Enqueued));
        }
        let ids: Vec<u64> = std::iter::from_fn(|| policy.pop(&seat))
            .map(|popped| popped.task.id().as_u64())
            .collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
        assert!(policy.is_empty());
    }

    #[test]
    fn test_full_stack() {
        let policy = CentralStack::new(2);
        let seat = Seat::new(0, 0, 0);
        assert!(matches!(policy.push(&seat, task(1)), Push::Enqueued));
        assert!(matches!(policy.push(&seat, task(2)), Push::Enqueued));
        assert!(matches!(policy.push(&seat, task(3)), Push::Full(_)));
    }
}
