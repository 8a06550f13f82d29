//! `numa`: place each task on the node closest to the data it reads.
//!
//! Every node has a main queue, for tasks placed by footprint, and an
//! alternate queue, for tasks whose footprint is absent or too small to
//! matter. Those stay on the creating worker's node.

use super::{Popped, Push, PolicySetup, SchedulingPolicy, round_robin};
use crate::footprint::{Access, MemoryLocator, NodeDistribution};
use crate::queue::Queue;
use crate::task::Task;
use crate::topology::{Arch, WorkerMap};
use crate::worker::Seat;
use crossbeam::utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

pub struct Numa {
    arch: Arch,
    map: WorkerMap,
    queues: Box<[Queue<Box<Task>>]>,
    alt_queues: Box<[Queue<Box<Task>>]>,
    /// Per-worker starting point of the placement scan, rotated after every
    /// placement so equal-cost nodes take turns.
    bias: Box<[CachePadded<AtomicUsize>]>,
    locator: Option<Arc<dyn MemoryLocator>>,
    low_limit: u64,
}

impl Numa {
    pub fn new(setup: &PolicySetup<'_>) -> Self {
        let arch = setup.arch.clone();
        let nodes = arch.num_nodes();
        let low_limit = setup.numa_footprint.unwrap_or_else(|| {
            let cores_per_node = (arch.num_cores() / nodes).max(1);
            (arch.llc_size_kb() * 1024 / cores_per_node) as u64
        });
        let workers = setup.map.num_workers();
        Numa {
            queues: (0..nodes).map(|_| Queue::new(setup.queue_capacity)).collect(),
            alt_queues: (0..nodes).map(|_| Queue::new(setup.queue_capacity)).collect(),
            bias: (0..workers)
                .map(|worker| CachePadded::new(AtomicUsize::new(worker)))
                .collect(),
            map: setup.map.clone(),
            locator: setup.locator.clone(),
            low_limit,
            arch,
        }
    }

    /// Footprint size below which placement falls back to the local node.
    pub fn low_limit(&self) -> u64 {
        self.low_limit
    }

    fn read_distribution(&self, task: &Task) -> Option<NodeDistribution> {
        let locator = self.locator.as_deref()?;
        NodeDistribution::of_footprints(
            task.footprints(),
            Access::Read,
            locator,
            self.arch.num_nodes(),
        )
    }

    /// Node with the least cost for `dist`, scanning workers from the
    /// caller's bias and evaluating each run of same-node workers once.
    fn least_cost_node(&self, seat: &Seat, dist: &NodeDistribution) -> (usize, u64) {
        let workers = self.map.num_workers();
        let bias = &self.bias[seat.id()];
        let start = bias.load(Ordering::Relaxed) % workers;

        let mut best = (seat.node(), u64::MAX);
        let mut prev_node = None;
        for worker in (0..workers).map(|offset| (start + offset) % workers) {
            let node = self.map.node_of(worker);
            if prev_node == Some(node) {
                continue;
            }
            prev_node = Some(node);
            let cost = dist.comm_cost(&self.arch, node);
            if cost < best.1 {
                best = (node, cost);
            }
        }
        bias.store((start + 1) % workers, Ordering::Relaxed);
        best
    }

    fn enqueue(queue: &Queue<Box<Task>>, task: Box<Task>) -> Push {
        match queue.push(task) {
            Ok(()) => Push::Enqueued,
            Err(task) => Push::Full(task),
        }
    }
}

impl SchedulingPolicy for Numa {
    fn name(&self) -> &'static str {
        "numa"
    }

    fn push(&self, seat: &Seat, mut task: Box<Task>) -> Push {
        let dist = self.read_distribution(&task);
        match dist {
            Some(dist) if dist.is_significant(self.low_limit) => {
                let (node, cost) = self.least_cost_node(seat, &dist);
                task.set_comm_cost(cost);
                trace!(task = %task.id(), node, cost, "placed by footprint");
                Numa::enqueue(&self.queues[node], task)
            }
            Some(dist) => {
                task.set_comm_cost(dist.comm_cost(&self.arch, seat.node()));
                Numa::enqueue(&self.alt_queues[seat.node()], task)
            }
            None => Numa::enqueue(&self.alt_queues[seat.node()], task),
        }
    }

    fn pop(&self, seat: &Seat) -> Option<Popped> {
        let node = seat.node();
        if let Some(task) = self.alt_queues[node].pop() {
            return Some(Popped::owned(task));
        }
        if let Some(task) = self.queues[node].pop() {
            return Some(Popped::owned(task));
        }

        let stolen = round_robin(node, self.alt_queues.len())
            .filter(|&other| !self.alt_queues[other].is_empty())
            .find_map(|other| self.alt_queues[other].pop());
        if let Some(task) = stolen {
            return Some(Popped::stolen(task, None));
        }

        // Only raid remote main queues that hold more than their own node's
        // workers will drain soon.
        let cores_per_node = self.arch.cores_per_node();
        for distance in 1..=self.arch.diameter() {
            let threshold = cores_per_node * distance;
            for &remote in self.arch.vicinity(node, distance) {
                let queue = &self.queues[remote];
                if queue.size() > threshold {
                    if let Some(task) = queue.pop() {
                        return Some(Popped::stolen(task, Some(distance)));
                    }
                }
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.queues
            .iter()
            .chain(self.alt_queues.iter())
            .map(Queue::size)
            .sum()
    }

    fn capacity(&self) -> usize {
        self.queues.first().map_or(0, Queue::capacity)
    }
}
