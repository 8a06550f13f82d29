//! Context type for creating and waiting on tasks from inside the runtime.

use crate::error::{Error, Result};
use crate::footprint::Footprint;
use crate::recorder::State;
use crate::runtime::Shared;
use crate::task::{
    ArgBuffer, ForeignTaskFn, RawTaskFn, Task, TaskBody, TaskHandle, TaskId, TaskParts, check_name,
};
use crate::topology::Arch;
use crate::twc::TaskWaitCounter;
use crate::worker::{self, WorkerLocal};
use crossbeam::utils::Backoff;
use std::cell::Cell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

thread_local! {
    static CURRENT: Cell<*const WorkerLocal> = const { Cell::new(ptr::null()) };
}

/// Marks a worker as the one running on this thread until dropped.
///
/// A thread hosts at most one worker at a time.
pub(crate) struct CurrentGuard {
    local: *const WorkerLocal,
}

impl CurrentGuard {
    pub(crate) fn enter(local: &WorkerLocal) -> Result<Self> {
        let local = local as *const WorkerLocal;
        CURRENT.with(|current| {
            if !current.get().is_null() {
                return Err(Error::RuntimeActive);
            }
            current.set(local);
            Ok(CurrentGuard { local })
        })
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        // The slot may already be gone when a runtime is dropped during
        // thread teardown.
        let _ = CURRENT.try_with(|current| {
            if current.get() == self.local {
                current.set(ptr::null());
            }
        });
    }
}

/// Runs `f` with the context of the worker on this thread, if there is one.
///
/// This is how code without a `&Context` in hand, such as the C entry
/// points, reaches the runtime.
pub fn with_current<R>(f: impl FnOnce(&Context<'_>) -> R) -> Option<R> {
    let ptr = CURRENT.try_with(Cell::get).ok()?;
    if ptr.is_null() {
        return None;
    }
    // SAFETY: only the CurrentGuard of a live WorkerLocal installs the
    // pointer, and it clears it before that WorkerLocal is dropped.
    let local = unsafe { &*ptr };
    Some(f(&Context::new(local)))
}

/// Handle on the calling worker, passed to every task body.
///
/// A context is only valid on the worker it was made for and cannot be
/// sent to other threads.
pub struct Context<'a> {
    local: &'a WorkerLocal,
}

impl<'a> Context<'a> {
    pub(crate) fn new(local: &'a WorkerLocal) -> Self {
        Context { local }
    }

    pub fn worker_id(&self) -> usize {
        self.local.id()
    }

    /// NUMA node of the calling worker.
    pub fn node(&self) -> usize {
        self.local.seat.node()
    }

    pub fn num_workers(&self) -> usize {
        self.local.shared.map.num_workers()
    }

    pub fn arch(&self) -> &Arch {
        &self.local.shared.arch
    }

    /// The task being executed, or `None` at the top level.
    pub fn current_task(&self) -> Option<TaskId> {
        self.local.current_task()
    }

    /// Creates a task running `work`, as a child of the current task.
    pub fn spawn<F>(&self, work: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        launch_task(self.local, TaskBody::Closure(Box::new(work)), Launch::default());
    }

    /// Starts building a task with a name, footprints or a wait counter.
    pub fn task<F>(&self, work: F) -> TaskBuilder<'a>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        TaskBuilder {
            local: self.local,
            body: TaskBody::Closure(Box::new(work)),
            launch: Launch::default(),
        }
    }

    /// Creates a task from a function and a byte payload, copied into the
    /// task's argument buffer.
    pub fn spawn_raw(
        &self,
        func: RawTaskFn,
        args: &[u8],
        footprints: &[Footprint],
        name: Option<&str>,
    ) -> Result<()> {
        let body = TaskBody::Raw {
            func,
            args: ArgBuffer::copy_from(args)?,
        };
        self.spawn_body(body, footprints, name)
    }

    /// Builder for a task running a C function on a copy of `args`.
    pub(crate) fn foreign_task(&self, func: ForeignTaskFn, args: &[u8]) -> Result<TaskBuilder<'a>> {
        Ok(TaskBuilder {
            local: self.local,
            body: TaskBody::Foreign {
                func,
                args: ArgBuffer::copy_from(args)?,
            },
            launch: Launch::default(),
        })
    }

    fn spawn_body(&self, body: TaskBody, footprints: &[Footprint], name: Option<&str>) -> Result<()> {
        let launch = Launch {
            name: name.map(str::to_string),
            footprints: footprints.to_vec(),
            ..Launch::default()
        };
        launch.validate(self.local)?;
        launch_task(self.local, body, launch);
        Ok(())
    }

    /// A new counter for grouping tasks created with
    /// [`TaskBuilder::in_twc`].
    pub fn twc(&self) -> Arc<TaskWaitCounter> {
        Arc::new(TaskWaitCounter::new(self.num_workers()))
    }

    /// Waits for every child of the current task, or at the top level for
    /// every task created outside a task. Runs other tasks meanwhile.
    pub fn wait(&self) {
        if let Some(twc) = self.local.wait_target() {
            self.wait_on(&twc);
        }
    }

    /// Waits until every task linked to `twc` has completed, then readies
    /// it for reuse.
    pub fn wait_on(&self, twc: &TaskWaitCounter) {
        if twc.count() == 0 {
            return;
        }
        wait_and_help(self.local, || twc.try_finish(), || twc.completed());
    }

    /// Waits for a single task.
    pub fn wait_for(&self, handle: &TaskHandle) {
        wait_and_help(self.local, || handle.is_done(), || 0);
    }

    /// Runs at most one queued task. Returns whether one ran.
    pub fn yield_now(&self) -> bool {
        worker::do_work(self.local, false)
    }
}

/// Builder for a task with options.
///
/// ```no_run
/// # let rt = mir::Runtime::builder().build().unwrap();
/// let handle = rt
///     .task(|_| println!("hello"))
///     .name("greet")
///     .spawn_handle()
///     .unwrap();
/// rt.context().wait_for(&handle);
/// ```
#[must_use = "a task builder does nothing until spawned"]
pub struct TaskBuilder<'a> {
    local: &'a WorkerLocal,
    body: TaskBody,
    launch: Launch,
}

impl<'a> TaskBuilder<'a> {
    /// Name shown in task statistics, at most 31 bytes.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.launch.name = Some(name.into());
        self
    }

    pub fn footprint(mut self, footprint: Footprint) -> Self {
        self.launch.footprints.push(footprint);
        self
    }

    pub fn footprints(mut self, footprints: impl IntoIterator<Item = Footprint>) -> Self {
        self.launch.footprints.extend(footprints);
        self
    }

    /// Links the task to `twc` instead of the creator's children.
    pub fn in_twc(mut self, twc: &Arc<TaskWaitCounter>) -> Self {
        self.launch.twc = Some(twc.clone());
        self
    }

    /// Runs the task on `worker`, bypassing the scheduling policy.
    pub fn on_worker(mut self, worker: usize) -> Self {
        self.launch.worker = Some(worker);
        self
    }

    pub fn spawn(self) -> Result<()> {
        self.launch.validate(self.local)?;
        launch_task(self.local, self.body, self.launch);
        Ok(())
    }

    /// Spawns the task and returns a handle to wait on it alone.
    pub fn spawn_handle(mut self) -> Result<TaskHandle> {
        self.launch.validate(self.local)?;
        let done = Arc::new(AtomicBool::new(false));
        self.launch.signal = Some(done.clone());
        let id = launch_task(self.local, self.body, self.launch);
        Ok(TaskHandle::new(id, done))
    }
}

#[derive(Default)]
struct Launch {
    name: Option<String>,
    footprints: Vec<Footprint>,
    twc: Option<Arc<TaskWaitCounter>>,
    worker: Option<usize>,
    signal: Option<Arc<AtomicBool>>,
}

impl Launch {
    /// Checks everything that can fail before the task is linked anywhere.
    fn validate(&self, local: &WorkerLocal) -> Result<()> {
        if let Some(name) = &self.name {
            check_name(name)?;
        }
        let workers = local.shared.map.num_workers();
        match self.worker {
            Some(worker) if worker >= workers => Err(Error::NoSuchWorker { worker, workers }),
            _ => Ok(()),
        }
    }
}

fn launch_task(local: &WorkerLocal, body: TaskBody, launch: Launch) -> TaskId {
    let (parent, depth, twc) = local.link_child(launch.twc.as_ref());
    twc.add_child();
    let id = local.shared.next_task_id();
    let task = Task::new(TaskParts {
        id,
        name: launch.name.map(String::into_boxed_str),
        parent,
        depth,
        body,
        footprints: launch.footprints,
        twc,
        signal: launch.signal,
    });
    worker::submit(local, task, launch.worker);
    id
}

/// Blocks until `done` holds, running queued tasks in the meantime.
///
/// `progress` reports a value that changes whenever the awaited work
/// advances; the liveness check uses it to tell a slow wait from a stuck one.
fn wait_and_help(local: &WorkerLocal, done: impl Fn() -> bool, progress: impl Fn() -> usize) {
    if done() {
        return;
    }
    let _waiting = Waiting::enter(local);
    let backoff = Backoff::new();
    let mut watchdog = Watchdog::new(&local.shared, progress());
    while !done() {
        if worker::do_work(local, false) {
            backoff.reset();
            watchdog.progressed();
        } else {
            backoff.snooze();
            watchdog.check(progress());
        }
    }
}

/// Accounts for a worker blocked in a wait. A wait inside a task keeps
/// the worker busy without making progress on its own.
struct Waiting<'a> {
    local: &'a WorkerLocal,
    counted: bool,
}

impl<'a> Waiting<'a> {
    fn enter(local: &'a WorkerLocal) -> Self {
        let counted = local.in_task();
        if counted {
            local.shared.waiting.fetch_add(1, Ordering::SeqCst);
        }
        local.begin(State::Wait, None);
        Waiting { local, counted }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.local.end();
        if self.counted {
            self.local.shared.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Debug-build detector for waits that can never finish.
struct Watchdog<'a> {
    shared: &'a Shared,
    timeout: Option<Duration>,
    since: Instant,
    seen: usize,
}

impl<'a> Watchdog<'a> {
    fn new(shared: &'a Shared, seen: usize) -> Self {
        let timeout = if cfg!(debug_assertions) {
            shared.config.liveness_timeout
        } else {
            None
        };
        Watchdog {
            shared,
            timeout,
            since: Instant::now(),
            seen,
        }
    }

    fn progressed(&mut self) {
        if self.timeout.is_some() {
            self.since = Instant::now();
        }
    }

    fn check(&mut self, seen: usize) {
        let Some(timeout) = self.timeout else {
            return;
        };
        if seen != self.seen {
            self.seen = seen;
            self.since = Instant::now();
            return;
        }
        if self.since.elapsed() < timeout {
            return;
        }
        if self.shared.is_stalled() {
            thread::sleep(Duration::from_millis(1));
            if self.shared.is_stalled() {
                panic!(
                    "liveness violation: no progress for {timeout:?}, nothing is queued and every busy worker is waiting"
                );
            }
        }
        self.since = Instant::now();
    }
}
