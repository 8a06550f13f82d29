//! High-level runtime interface.
//!
//! The [`Runtime`] is the primary entry point: it detects or selects the
//! machine, starts one worker per configured core, and provides methods for
//! creating tasks and waiting on them. The thread that creates the runtime
//! becomes worker 0.

use crate::config::{Config, PinningStrategy};
use crate::context::{Context, CurrentGuard, TaskBuilder};
use crate::error::{Error, Result};
use crate::footprint::{Footprint, MemoryLocator};
use crate::lock::{Gate, Lock};
use crate::policy::{PolicyKind, PolicySetup, SchedulingPolicy};
use crate::queue::Queue;
use crate::recorder::{self, TraceEvent};
use crate::stats::{self, TaskRecord, WorkerStats};
use crate::task::{RawTaskFn, Task, TaskHandle, TaskId};
use crate::topology::{Arch, WorkerMap};
use crate::twc::TaskWaitCounter;
use crate::worker::{self, Harvest, WorkerLocal, WorkerPool};
use crossbeam::utils::{Backoff, CachePadded};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared by every worker of one runtime.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) arch: Arch,
    pub(crate) map: WorkerMap,
    pub(crate) policy: Box<dyn SchedulingPolicy>,
    pub(crate) locator: Option<Arc<dyn MemoryLocator>>,
    /// One queue per worker for tasks addressed to it.
    pub(crate) private_queues: Box<[Queue<Box<Task>>]>,
    /// Counter of tasks created outside any task.
    pub(crate) global_twc: Arc<TaskWaitCounter>,
    next_id: AtomicU64,
    /// Tasks sitting in a container.
    pub(crate) queued: CachePadded<AtomicUsize>,
    /// Workers executing or about to execute a task.
    pub(crate) busy: CachePadded<AtomicUsize>,
    /// Busy workers blocked in a wait.
    pub(crate) waiting: CachePadded<AtomicUsize>,
    pub(crate) alive: AtomicUsize,
    pub(crate) parked: AtomicUsize,
    pub(crate) dying: AtomicBool,
    pub(crate) die_gate: Gate,
    pub(crate) harvest: Lock<Vec<Harvest>>,
    pub(crate) startup_error: Lock<Option<Error>>,
}

impl Shared {
    fn new(
        config: Config,
        arch: Arch,
        map: WorkerMap,
        policy: Box<dyn SchedulingPolicy>,
        locator: Option<Arc<dyn MemoryLocator>>,
    ) -> Self {
        let workers = map.num_workers();
        Shared {
            private_queues: (0..workers)
                .map(|_| Queue::new(config.queue_capacity))
                .collect(),
            global_twc: Arc::new(TaskWaitCounter::new(workers)),
            next_id: AtomicU64::new(1),
            queued: CachePadded::new(AtomicUsize::new(0)),
            busy: CachePadded::new(AtomicUsize::new(0)),
            waiting: CachePadded::new(AtomicUsize::new(0)),
            alive: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            dying: AtomicBool::new(false),
            die_gate: Gate::new(),
            harvest: Lock::new(Vec::with_capacity(workers)),
            startup_error: Lock::new(None),
            config,
            arch,
            map,
            policy,
            locator,
        }
    }

    pub(crate) fn next_task_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// No task is queued or running.
    fn is_quiescent(&self) -> bool {
        self.queued.load(Ordering::SeqCst) == 0 && self.busy.load(Ordering::SeqCst) == 0
    }

    /// Nothing is queued and every busy worker is blocked in a wait.
    pub(crate) fn is_stalled(&self) -> bool {
        // Read order matters: a task popped after `queued` is read was
        // already counted busy.
        let queued = self.queued.load(Ordering::SeqCst);
        let busy = self.busy.load(Ordering::SeqCst);
        let waiting = self.waiting.load(Ordering::SeqCst);
        queued == 0 && busy <= waiting
    }
}

/// Options for creating a [`Runtime`].
///
/// Starts from [`Config::default`]; every setter overrides one field.
#[derive(Default)]
pub struct Builder {
    config: Config,
    arch: Option<Arch>,
    locator: Option<Arc<dyn MemoryLocator>>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = Some(workers);
        self
    }

    pub fn policy(mut self, policy: PolicyKind) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn inlining_limit(mut self, limit: usize) -> Self {
        self.config.inlining_limit = limit;
        self
    }

    pub fn inline_when_full(mut self, inline: bool) -> Self {
        self.config.inline_when_full = inline;
        self
    }

    pub fn pinning(mut self, pinning: PinningStrategy) -> Self {
        self.config.pinning = pinning;
        self
    }

    pub fn numa_footprint(mut self, bytes: u64) -> Self {
        self.config.numa_footprint = Some(bytes);
        self
    }

    pub fn worker_stats(mut self, enabled: bool) -> Self {
        self.config.worker_stats = enabled;
        self
    }

    pub fn task_stats(mut self, enabled: bool) -> Self {
        self.config.task_stats = enabled;
        self
    }

    pub fn recorder(mut self, enabled: bool) -> Self {
        self.config.recorder = enabled;
        self
    }

    /// Debug builds: panic when a wait is stuck for `timeout`.
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.config.liveness_timeout = Some(timeout);
        self
    }

    /// Uses `arch` instead of detecting the host.
    pub fn arch(mut self, arch: Arch) -> Self {
        self.arch = Some(arch);
        self
    }

    /// Source of data placement for footprint-driven policies.
    pub fn locator(mut self, locator: Arc<dyn MemoryLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Validates the configuration, starts the workers and makes the calling
    /// thread worker 0.
    ///
    /// # Errors
    ///
    /// Any configuration error, or a worker that could not be spawned or
    /// pinned. No thread is left running on error.
    pub fn build(self) -> Result<Runtime> {
        let arch = match (self.arch, &self.config.arch) {
            (Some(arch), _) => arch,
            (None, Some(name)) => {
                Arch::by_name(name).ok_or_else(|| Error::UnknownArch(name.clone()))?
            }
            (None, None) => Arch::detect(),
        };
        let cores = self.config.placement(&arch)?;
        let map = WorkerMap::new(&arch, &cores);
        let policy = self.config.policy.build(&PolicySetup {
            arch: &arch,
            map: &map,
            queue_capacity: self.config.queue_capacity,
            numa_footprint: self.config.numa_footprint,
            locator: self.locator.clone(),
        });
        info!(
            arch = arch.name(),
            workers = map.num_workers(),
            policy = policy.name(),
            memory_policy = %self.config.memory_policy,
            "creating runtime"
        );

        let shared = Arc::new(Shared::new(self.config, arch, map, policy, self.locator));
        let master = Box::new(WorkerLocal::new(shared.clone(), 0));
        let current = CurrentGuard::enter(&master)?;
        master.bind()?;

        let pool = WorkerPool::spawn(&shared)?;
        let backoff = Backoff::new();
        while shared.alive.load(Ordering::Acquire) < pool.len() {
            backoff.snooze();
        }
        let startup_error = shared.startup_error.lock().take();
        if let Some(err) = startup_error {
            shared.dying.store(true, Ordering::Release);
            shared.die_gate.open();
            let _ = pool.join();
            return Err(err);
        }

        debug!("all workers started");
        Ok(Runtime {
            current: Some(current),
            master,
            pool: Some(pool),
            shared,
        })
    }
}

impl From<Config> for Builder {
    fn from(config: Config) -> Self {
        Builder {
            config,
            ..Builder::default()
        }
    }
}

/// Everything collected while the runtime ran, returned by
/// [`Runtime::destroy`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct Report {
    /// Per-worker counters, ordered by worker. All zero unless worker
    /// statistics were enabled.
    pub workers: Vec<WorkerStats>,
    /// One record per executed task when task statistics were enabled.
    pub tasks: Vec<TaskRecord>,
    /// Recorder spans of every worker when the recorder was enabled.
    pub trace: Vec<TraceEvent>,
    /// Tasks whose body panicked.
    pub panicked_tasks: usize,
}

impl Report {
    fn from_harvest(harvest: Vec<Harvest>) -> Self {
        let mut report = Report::default();
        for worker in harvest {
            report.workers.push(worker.stats);
            report.tasks.extend(worker.tasks);
            report.trace.extend(worker.trace);
            report.panicked_tasks += worker.panicked;
        }
        report
    }

    pub fn tasks_executed(&self) -> u64 {
        self.workers.iter().map(WorkerStats::executed).sum()
    }

    pub fn write_worker_stats(&self, path: impl AsRef<Path>) -> Result<()> {
        stats::write_to_file(path, &self.workers, stats::write_worker_stats)?;
        Ok(())
    }

    pub fn write_task_stats(&self, path: impl AsRef<Path>) -> Result<()> {
        stats::write_to_file(path, &self.tasks, stats::write_task_stats)?;
        Ok(())
    }

    pub fn export_trace(&self, path: impl AsRef<Path>) -> Result<()> {
        recorder::export_to_file(path, &self.trace)?;
        Ok(())
    }

    /// Writes the files `config` enabled into `dir`, under their default names.
    pub fn write_enabled(&self, config: &Config, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        if config.worker_stats {
            self.write_worker_stats(dir.join(stats::WORKER_STATS_FILE))?;
        }
        if config.task_stats {
            self.write_task_stats(dir.join(stats::TASK_STATS_FILE))?;
        }
        if config.recorder {
            self.export_trace(dir.join(recorder::TRACE_FILE))?;
        }
        Ok(())
    }
}

/// A running task-parallel runtime.
///
/// The runtime is bound to the thread that created it. Dropping it waits
/// for every outstanding task and stops the workers; use
/// [`destroy`](Runtime::destroy) to also get the collected statistics.
///
/// # Example
///
/// ```no_run
/// use mir::Runtime;
///
/// let rt = Runtime::builder().workers(4).build().unwrap();
/// rt.spawn(|ctx| {
///     ctx.spawn(|_| println!("child"));
///     ctx.wait();
/// });
/// rt.wait();
/// rt.destroy().unwrap();
/// ```
pub struct Runtime {
    current: Option<CurrentGuard>,
    master: Box<WorkerLocal>,
    pool: Option<WorkerPool>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("num_workers", &self.num_workers())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates a runtime from `config`.
    pub fn new(config: Config) -> Result<Runtime> {
        Builder::from(config).build()
    }

    /// Creates a runtime configured by the `MIR_CONF` environment variable.
    pub fn from_env() -> Result<Runtime> {
        Runtime::new(Config::from_env()?)
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn num_workers(&self) -> usize {
        self.shared.map.num_workers()
    }

    pub fn arch(&self) -> &Arch {
        &self.shared.arch
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn policy_name(&self) -> &'static str {
        self.shared.policy.name()
    }

    /// Context of worker 0, the creating thread.
    pub fn context(&self) -> Context<'_> {
        Context::new(&self.master)
    }

    /// Creates a top-level task.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # let rt = mir::Runtime::builder().build().unwrap();
    /// rt.spawn(|ctx| println!("on worker {}", ctx.worker_id()));
    /// rt.wait();
    /// ```
    pub fn spawn<F>(&self, work: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.context().spawn(work);
    }

    pub fn task<F>(&self, work: F) -> TaskBuilder<'_>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.context().task(work)
    }

    pub fn spawn_raw(
        &self,
        func: RawTaskFn,
        args: &[u8],
        footprints: &[Footprint],
        name: Option<&str>,
    ) -> Result<()> {
        self.context().spawn_raw(func, args, footprints, name)
    }

    /// Waits for every top-level task, helping meanwhile.
    pub fn wait(&self) {
        self.context().wait();
    }

    pub fn twc(&self) -> Arc<TaskWaitCounter> {
        self.context().twc()
    }

    pub fn wait_on(&self, twc: &TaskWaitCounter) {
        self.context().wait_on(twc);
    }

    pub fn wait_for(&self, handle: &TaskHandle) {
        self.context().wait_for(handle);
    }

    /// Helps until no task is queued or running anywhere.
    pub fn check_done(&self) {
        let backoff = Backoff::new();
        while !self.shared.is_quiescent() {
            if worker::do_work(&self.master, false) {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Waits for all tasks, stops the workers and returns what they collected.
    ///
    /// # Errors
    ///
    /// [`Error::WorkerPanicked`] if a worker thread died outside a task.
    pub fn destroy(mut self) -> Result<Report> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<Report> {
        let Some(pool) = self.pool.take() else {
            return Ok(Report::default());
        };
        debug!("waiting for outstanding tasks");
        self.wait_on(&self.shared.global_twc);
        self.check_done();

        debug!("sending die signal");
        self.shared.dying.store(true, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.shared.parked.load(Ordering::Acquire) < pool.len() {
            backoff.snooze();
        }
        let mut harvest = std::mem::take(&mut *self.shared.harvest.lock());
        harvest.push(self.master.harvest());
        harvest.sort_by_key(|worker| worker.worker);
        self.shared.die_gate.open();
        let joined = pool.join();
        self.current.take();

        let report = Report::from_harvest(harvest);
        if report.panicked_tasks > 0 {
            warn!(tasks = report.panicked_tasks, "tasks panicked during the run");
        }
        joined.map_err(Error::WorkerPanicked)?;
        info!("runtime destroyed");
        Ok(report)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("shutdown: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn builder(workers: usize) -> Builder {
        Runtime::builder()
            .workers(workers)
            .pinning(PinningStrategy::None)
            .arch(Arch::uniform("fixture", workers))
    }

    #[test]
    fn test_runtime_creation() {
        let rt = builder(4).build().unwrap();
        assert_eq!(rt.num_workers(), 4);
        assert_eq!(rt.policy_name(), "central-stack");
        assert_eq!(rt.arch().name(), "fixture");
        rt.destroy().unwrap();
    }

    #[test]
    fn test_config_errors_start_nothing() {
        let err = builder(4).workers(8).build().unwrap_err();
        assert!(matches!(err, Error::TooManyWorkers { workers: 8, cores: 4 }));
        let err = builder(4).workers(0).build().unwrap_err();
        assert!(matches!(err, Error::NoWorkers));
        let err = Runtime::builder()
            .config(Config {
                arch: Some("no-such-machine".into()),
                ..Config::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownArch(_)));
    }

    #[test]
    fn test_task_ids_are_sequential() {
        let rt = builder(1).build().unwrap();
        let first = rt.task(|_| {}).spawn_handle().unwrap();
        let second = rt.task(|_| {}).spawn_handle().unwrap();
        assert_eq!(first.id().as_u64(), 1);
        assert_eq!(second.id().as_u64(), 2);
        rt.wait();
        rt.destroy().unwrap();
    }

    #[test]
    fn test_destroy_drains_outstanding_tasks() {
        let rt = builder(3).build().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            rt.spawn(move |ctx| {
                let counter = counter.clone();
                ctx.spawn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            });
        }
        // No wait: destroy must finish the work first.
        rt.destroy().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_drop_shuts_down() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let rt = builder(2).build().unwrap();
            let counter = counter.clone();
            rt.spawn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_report_collects_stats() {
        let rt = builder(2).worker_stats(true).task_stats(true).recorder(true).build().unwrap();
        for _ in 0..20 {
            rt.task(|_| {}).name("leaf").spawn().unwrap();
        }
        rt.wait();
        let report = rt.destroy().unwrap();
        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.workers[0].worker, 0);
        assert_eq!(report.workers[1].worker, 1);
        assert_eq!(report.tasks_executed(), 20);
        assert_eq!(report.workers[0].created, 20);
        assert_eq!(report.tasks.len(), 20);
        assert!(report.tasks.iter().all(|t| t.name.as_deref() == Some("leaf")));
        assert!(report.trace.iter().any(|e| e.state == recorder::State::Task));
    }

    #[test]
    fn test_runtimes_can_be_recreated() {
        for _ in 0..3 {
            let rt = builder(2).build().unwrap();
            rt.spawn(|_| {});
            rt.destroy().unwrap();
        }
    }

    #[test]
    fn test_one_runtime_per_thread() {
        let rt = builder(2).build().unwrap();
        let err = builder(1).build().unwrap_err();
        assert!(matches!(err, Error::RuntimeActive));
        assert_eq!(crate::with_current(|ctx| ctx.num_workers()), Some(2));

        drop(rt);
        assert!(crate::with_current(|_| ()).is_none());
        builder(1).build().unwrap().destroy().unwrap();
    }
}
