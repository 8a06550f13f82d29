//! Worker threads.
//!
//! Each worker is an OS thread pinned to one core. It loops popping tasks
//! from its private queue and the scheduling policy, backing off
//! exponentially when it finds nothing, until the runtime tells it to die.
//! The thread that creates the runtime is worker 0 and has no loop of its
//! own: it works only while it waits.

use crate::config::PinningStrategy;
use crate::context::{Context, CurrentGuard};
use crate::error::{Error, Result, fatal};
use crate::footprint::{Access, NodeDistribution};
use crate::policy::{PolicyKind, Popped, Push};
use crate::recorder::{Recorder, State, TraceEvent};
use crate::runtime::Shared;
use crate::stats::{TaskRecord, WorkerStats};
use crate::task::{Task, TaskId};
use crate::twc::TaskWaitCounter;
use core_affinity::CoreId;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const BACKOFF_RESET_US: u64 = 1;
const BACKOFF_MAX_US: u64 = 1000;

/// Identity of the worker running on the current thread.
///
/// A seat is created by the runtime on the thread it describes and cannot
/// leave it (`!Send`), so holding one proves the caller is that worker.
#[derive(Debug)]
pub struct Seat {
    id: usize,
    core: usize,
    node: usize,
    _thread_bound: PhantomData<*const ()>,
}

impl Seat {
    pub(crate) fn new(id: usize, core: usize, node: usize) -> Self {
        Seat {
            id,
            core,
            node,
            _thread_bound: PhantomData,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn node(&self) -> usize {
        self.node
    }
}

/// Bookkeeping for the task a worker is executing. Frames stack up when a
/// waiting task runs other tasks.
struct Frame {
    task: TaskId,
    depth: u32,
    /// Counter the task's own children report to, created with the first child.
    child_twc: Option<Arc<TaskWaitCounter>>,
    children: u32,
    overhead: Duration,
}

/// What a worker hands back at shutdown.
#[derive(Debug, Default)]
pub(crate) struct Harvest {
    pub worker: usize,
    pub stats: WorkerStats,
    pub tasks: Vec<TaskRecord>,
    pub trace: Vec<TraceEvent>,
    pub panicked: usize,
}

/// State owned by one worker thread.
pub(crate) struct WorkerLocal {
    pub(crate) seat: Seat,
    pub(crate) shared: Arc<Shared>,
    frames: RefCell<Vec<Frame>>,
    backoff_us: Cell<u64>,
    stats: RefCell<WorkerStats>,
    records: RefCell<Vec<TaskRecord>>,
    recorder: RefCell<Option<Recorder>>,
    panicked: Cell<usize>,
}

impl WorkerLocal {
    pub(crate) fn new(shared: Arc<Shared>, id: usize) -> Self {
        let core = shared.map.core_of(id);
        let node = shared.map.node_of(id);
        let distances = match shared.config.policy {
            PolicyKind::Numa | PolicyKind::WsDeNode => shared.arch.diameter(),
            _ => 0,
        };
        let recorder = shared.config.recorder.then(|| Recorder::new(id));
        WorkerLocal {
            seat: Seat::new(id, core, node),
            frames: RefCell::new(Vec::new()),
            backoff_us: Cell::new(BACKOFF_RESET_US),
            stats: RefCell::new(WorkerStats::new(id, distances)),
            records: RefCell::new(Vec::new()),
            recorder: RefCell::new(recorder),
            panicked: Cell::new(0),
            shared,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.seat.id
    }

    /// Pins the current thread to this worker's core.
    pub(crate) fn bind(&self) -> Result<()> {
        match self.shared.config.pinning {
            PinningStrategy::None => Ok(()),
            PinningStrategy::Linear => {
                let cpu = self.shared.arch.sys_cpu_of(self.seat.core);
                if core_affinity::set_for_current(CoreId { id: cpu }) {
                    debug!(worker = self.id(), cpu, "worker bound");
                    Ok(())
                } else {
                    Err(Error::PinningFailed {
                        worker: self.id(),
                        cpu,
                    })
                }
            }
        }
    }

    pub(crate) fn in_task(&self) -> bool {
        !self.frames.borrow().is_empty()
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        self.frames.borrow().last().map(|frame| frame.task)
    }

    /// Registers a new child of the current task (or of the top level) and
    /// returns its parent, depth and the counter it will report to.
    pub(crate) fn link_child(
        &self,
        explicit: Option<&Arc<TaskWaitCounter>>,
    ) -> (Option<TaskId>, u32, Arc<TaskWaitCounter>) {
        let workers = self.shared.map.num_workers();
        let mut frames = self.frames.borrow_mut();
        match frames.last_mut() {
            Some(frame) => {
                frame.children += 1;
                let twc = match explicit {
                    Some(twc) => twc.clone(),
                    None => frame
                        .child_twc
                        .get_or_insert_with(|| Arc::new(TaskWaitCounter::new(workers)))
                        .clone(),
                };
                (Some(frame.task), frame.depth + 1, twc)
            }
            None => {
                let twc = explicit
                    .cloned()
                    .unwrap_or_else(|| self.shared.global_twc.clone());
                (None, 0, twc)
            }
        }
    }

    /// Counter a plain `wait` blocks on: the current task's children, or
    /// every top-level task. `None` when the current task has no children.
    pub(crate) fn wait_target(&self) -> Option<Arc<TaskWaitCounter>> {
        match self.frames.borrow().last() {
            Some(frame) => frame.child_twc.clone(),
            None => Some(self.shared.global_twc.clone()),
        }
    }

    pub(crate) fn begin(&self, state: State, task: Option<TaskId>) {
        if let Some(recorder) = self.recorder.borrow_mut().as_mut() {
            recorder.begin(state, task);
        }
    }

    pub(crate) fn end(&self) {
        if let Some(recorder) = self.recorder.borrow_mut().as_mut() {
            recorder.end();
        }
    }

    fn add_overhead(&self, elapsed: Duration) {
        if let Some(frame) = self.frames.borrow_mut().last_mut() {
            frame.overhead += elapsed;
        }
    }

    fn count(&self, update: impl FnOnce(&mut WorkerStats)) {
        if self.shared.config.worker_stats {
            update(&mut self.stats.borrow_mut());
        }
    }

    fn reset_backoff(&self) {
        self.backoff_us.set(BACKOFF_RESET_US);
    }

    fn back_off(&self) {
        let us = self.backoff_us.get();
        self.begin(State::Backoff, None);
        thread::sleep(Duration::from_micros(us));
        self.end();
        self.backoff_us.set((us * 2).min(BACKOFF_MAX_US));
    }

    fn pop(&self) -> Option<Popped> {
        if let Some(task) = self.shared.private_queues[self.id()].pop() {
            return Some(Popped::owned(task));
        }
        self.shared.policy.pop(&self.seat)
    }

    /// Cost of running `task` on this worker's node, if it reads anything.
    fn comm_cost_here(&self, task: &Task) -> Option<u64> {
        let locator = self.shared.locator.as_deref()?;
        let dist = NodeDistribution::of_footprints(
            task.footprints(),
            Access::Read,
            locator,
            self.shared.arch.num_nodes(),
        )?;
        Some(dist.comm_cost(&self.shared.arch, self.seat.node))
    }

    /// Updates the pop statistics and settles the task's cost estimate.
    fn account(&self, popped: Popped) -> Box<Task> {
        let mut task = popped.task;
        if !self.shared.config.worker_stats {
            return task;
        }
        let cost = match task.comm_cost() {
            Some(cost) if !popped.stolen => Some(cost),
            _ => self.comm_cost_here(&task),
        };
        let mut stats = self.stats.borrow_mut();
        if popped.stolen {
            stats.stolen += 1;
        } else {
            stats.owned += 1;
        }
        if let Some(cost) = cost {
            task.set_comm_cost(cost);
            stats.record_comm_cost(cost);
            if let Some(distance) = popped.distance {
                stats.record_steal_distance(distance);
            }
        }
        task
    }

    pub(crate) fn harvest(&self) -> Harvest {
        Harvest {
            worker: self.id(),
            stats: self.stats.take(),
            tasks: self.records.take(),
            trace: self
                .recorder
                .borrow_mut()
                .take()
                .map(Recorder::finish)
                .unwrap_or_default(),
            panicked: self.panicked.get(),
        }
    }
}

/// Pops one task and runs it. Without a task, sleeps for the current
/// backoff when `backoff` is set. Returns whether a task ran.
pub(crate) fn do_work(local: &WorkerLocal, backoff: bool) -> bool {
    let shared = &local.shared;
    let started = Instant::now();
    // Counted busy before popping so a quiescence check never sees the
    // task in neither place.
    shared.busy.fetch_add(1, Ordering::SeqCst);
    match local.pop() {
        Some(popped) => {
            shared.queued.fetch_sub(1, Ordering::SeqCst);
            local.add_overhead(started.elapsed());
            let task = local.account(popped);
            execute(local, task);
            shared.busy.fetch_sub(1, Ordering::SeqCst);
            local.reset_backoff();
            true
        }
        None => {
            shared.busy.fetch_sub(1, Ordering::SeqCst);
            if backoff {
                local.back_off();
            }
            local.add_overhead(started.elapsed());
            false
        }
    }
}

/// Runs `task` on this worker: prolog, body, epilog.
pub(crate) fn execute(local: &WorkerLocal, mut task: Box<Task>) {
    let started = Instant::now();
    local.frames.borrow_mut().push(Frame {
        task: task.id(),
        depth: task.depth(),
        child_twc: None,
        children: 0,
        overhead: Duration::ZERO,
    });
    local.begin(State::Task, Some(task.id()));

    let mut panicked = false;
    if let Some(body) = task.take_body() {
        let ctx = Context::new(local);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body.run(&ctx))) {
            panicked = true;
            local.panicked.set(local.panicked.get() + 1);
            error!(
                task = %task.id(),
                worker = local.id(),
                "task panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }

    let exec = started.elapsed();
    local.end();
    let frame = local.frames.borrow_mut().pop();
    task.finish(local.id());

    if local.shared.config.task_stats {
        if let Some(frame) = frame {
            local.records.borrow_mut().push(TaskRecord {
                id: task.id(),
                name: task.name().map(str::to_string),
                parent: task.parent(),
                worker: local.id(),
                depth: frame.depth,
                queued: started.saturating_duration_since(task.created()),
                exec,
                overhead: frame.overhead,
                children: frame.children,
                comm_cost: task.comm_cost(),
                panicked,
            });
        }
    }
}

/// Hands a new task to the scheduler: the private queue of `target`, or
/// the policy. Runs it on the spot when too many tasks are queued or the
/// container is full and inlining is allowed.
pub(crate) fn submit(local: &WorkerLocal, task: Box<Task>, target: Option<usize>) {
    let shared = &local.shared;
    let limit = shared.config.inlining_limit;
    if limit > 0 && shared.queued.load(Ordering::Relaxed) >= limit * shared.map.num_workers() {
        local.count(|stats| stats.inlined += 1);
        execute(local, task);
        return;
    }

    shared.queued.fetch_add(1, Ordering::SeqCst);
    let rejected = match target {
        Some(worker) => shared.private_queues[worker].push(task).err(),
        None => match shared.policy.push(&local.seat, task) {
            Push::Enqueued => None,
            Push::Full(task) => Some(task),
        },
    };
    let Some(task) = rejected else {
        local.count(|stats| stats.created += 1);
        return;
    };
    shared.queued.fetch_sub(1, Ordering::SeqCst);

    if target.is_none() && shared.config.inline_when_full {
        warn!(task = %task.id(), "queue full, running inline");
        local.count(|stats| stats.inlined += 1);
        execute(local, task);
        return;
    }

    let capacity = match target {
        Some(worker) => shared.private_queues[worker].capacity(),
        None => shared.policy.capacity(),
    };
    error!(task = %task.id(), worker = local.id(), "task dropped, no room to enqueue it");
    fatal(Error::QueueFull { capacity })
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Counts the worker as parked even if its thread dies outside a task, so
/// shutdown never waits for it forever.
struct ParkOnUnwind<'a>(&'a Shared);

impl Drop for ParkOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.parked.fetch_add(1, Ordering::AcqRel);
        }
    }
}

fn worker_main(shared: Arc<Shared>, id: usize) {
    let local = WorkerLocal::new(shared.clone(), id);
    if let Err(err) = local.bind() {
        error!(worker = id, "{err}");
        shared.startup_error.lock().get_or_insert(err);
    }
    // A fresh thread has no worker yet.
    let _current = CurrentGuard::enter(&local).ok();
    let _park = ParkOnUnwind(&shared);
    shared.alive.fetch_add(1, Ordering::AcqRel);

    local.begin(State::Idle, None);
    while !shared.dying.load(Ordering::Acquire) {
        do_work(&local, true);
    }
    local.end();

    let harvest = local.harvest();
    shared.harvest.lock().push(harvest);
    shared.parked.fetch_add(1, Ordering::AcqRel);
    shared.die_gate.wait();
    shared.alive.fetch_sub(1, Ordering::AcqRel);
}

/// The spawned workers, 1 through n - 1.
pub(crate) struct WorkerPool {
    handles: Vec<(usize, JoinHandle<()>)>,
}

impl WorkerPool {
    pub(crate) fn spawn(shared: &Arc<Shared>) -> Result<Self> {
        let workers = shared.map.num_workers();
        let stack_size = shared.config.worker_stack_size()?;
        let mut handles = Vec::with_capacity(workers.saturating_sub(1));
        for id in 1..workers {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("mir-worker-{id}"))
                .stack_size(stack_size)
                .spawn(move || worker_main(worker_shared, id));
            match spawned {
                Ok(handle) => handles.push((id, handle)),
                Err(err) => {
                    shared.dying.store(true, Ordering::Release);
                    shared.die_gate.open();
                    let _ = WorkerPool { handles }.join();
                    return Err(Error::WorkerSpawn(err));
                }
            }
        }
        Ok(WorkerPool { handles })
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Joins every worker. Returns the number that panicked.
    pub(crate) fn join(self) -> std::result::Result<(), usize> {
        let mut failed = 0;
        for (id, handle) in self.handles {
            if handle.join().is_err() {
                error!(worker = id, "worker thread panicked");
                failed += 1;
            }
        }
        if failed > 0 { Err(failed) } else { Ok(()) }
    }
}
