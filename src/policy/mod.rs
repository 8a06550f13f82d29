//! Scheduling policies.
//!
//! A policy owns the containers tasks wait in between creation and
//! execution. `push` decides where a new task goes, `pop` decides which
//! task a worker runs next: its own container first, then steals.

mod central;
mod central_stack;
mod numa;
mod ws;
mod ws_de;

pub use central::Central;
pub use central_stack::CentralStack;
pub use numa::Numa;
pub use ws::WorkStealing;
pub use ws_de::WorkStealingDeque;

use crate::error::{Error, Result};
use crate::footprint::MemoryLocator;
use crate::task::Task;
use crate::topology::{Arch, WorkerMap};
use crate::worker::Seat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Outcome of [`SchedulingPolicy::push`].
#[derive(Debug)]
pub enum Push {
    Enqueued,
    /// The target container is full; the caller gets the task back.
    Full(Box<Task>),
}

/// A task handed out by [`SchedulingPolicy::pop`].
#[derive(Debug)]
pub struct Popped {
    pub task: Box<Task>,
    /// Taken from a container the popping worker does not own.
    pub stolen: bool,
    /// Hop distance of the container the task was stolen from, when the
    /// policy steals by topology.
    pub distance: Option<usize>,
}

impl Popped {
    pub fn owned(task: Box<Task>) -> Self {
        Popped {
            task,
            stolen: false,
            distance: None,
        }
    }

    pub fn stolen(task: Box<Task>, distance: Option<usize>) -> Self {
        Popped {
            task,
            stolen: true,
            distance,
        }
    }
}

/// A task placement and retrieval strategy.
///
/// Implementations are shared by all workers. The [`Seat`] identifies the
/// calling worker and can only exist on that worker's thread, which is what
/// makes single-owner containers sound to use behind this trait.
pub trait SchedulingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Places `task`.
    fn push(&self, seat: &Seat, task: Box<Task>) -> Push;

    /// Takes the next task for the calling worker, if any.
    fn pop(&self, seat: &Seat) -> Option<Popped>;

    /// Approximate number of tasks held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of one container, reported when a push overflows.
    fn capacity(&self) -> usize;
}

/// Everything a policy may need at construction time.
pub struct PolicySetup<'a> {
    pub arch: &'a Arch,
    pub map: &'a WorkerMap,
    pub queue_capacity: usize,
    pub numa_footprint: Option<u64>,
    pub locator: Option<Arc<dyn MemoryLocator>>,
}

/// The closed set of available policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    Central,
    #[default]
    CentralStack,
    Ws,
    WsDe,
    WsDeNode,
    Numa,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 6] = [
        PolicyKind::Central,
        PolicyKind::CentralStack,
        PolicyKind::Ws,
        PolicyKind::WsDe,
        PolicyKind::WsDeNode,
        PolicyKind::Numa,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::Central => "central",
            PolicyKind::CentralStack => "central-stack",
            PolicyKind::Ws => "ws",
            PolicyKind::WsDe => "ws-de",
            PolicyKind::WsDeNode => "ws-de-node",
            PolicyKind::Numa => "numa",
        }
    }

    pub fn build(self, setup: &PolicySetup<'_>) -> Box<dyn SchedulingPolicy> {
        let workers = setup.map.num_workers();
        match self {
            PolicyKind::Central => Box::new(Central::new(setup.queue_capacity)),
            PolicyKind::CentralStack => Box::new(CentralStack::new(setup.queue_capacity)),
            PolicyKind::Ws => Box::new(WorkStealing::new(workers, setup.queue_capacity)),
            PolicyKind::WsDe => Box::new(WorkStealingDeque::new(workers, setup.queue_capacity)),
            PolicyKind::WsDeNode => Box::new(WorkStealingDeque::by_node(
                setup.arch.clone(),
                setup.map.clone(),
                setup.queue_capacity,
            )),
            PolicyKind::Numa => Box::new(Numa::new(setup)),
        }
    }
}

impl FromStr for PolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PolicyKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| Error::UnknownPolicy(s.to_string()))
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Visits every index except `start`, beginning after it and wrapping around.
pub(crate) fn round_robin(start: usize, len: usize) -> impl Iterator<Item = usize> {
    (1..len).map(move |offset| (start + offset) % len)
}
