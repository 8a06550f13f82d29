//! Task definitions.
//!
//! A task is a unit of work plus the bookkeeping the scheduler needs: its
//! id, the wait counter it reports completion to, and advisory footprints.
//! Tasks are uniquely owned (`Box<Task>`) from creation to the end of their
//! epilog, so every task is freed exactly once, right after it completes.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::footprint::Footprint;
use crate::twc::TaskWaitCounter;
use serde::Serialize;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Size of the inline argument buffer of raw tasks.
pub const ARG_BUFFER_SIZE: usize = 256;

/// Task names must be shorter than this many bytes.
pub const SHORT_NAME_LEN: usize = 32;

/// Unique, monotonically increasing task id. Ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry point of a raw task: receives the copied argument bytes.
pub type RawTaskFn = fn(&Context, &[u8]);

/// Entry point of a task created through the C API.
pub type ForeignTaskFn = unsafe extern "C" fn(*mut c_void);

/// Fixed-size argument buffer copied into raw tasks by value.
///
/// Aligned so C callers can cast the payload back to their argument struct.
#[repr(C, align(16))]
pub struct ArgBuffer {
    bytes: [u8; ARG_BUFFER_SIZE],
    len: usize,
}

impl ArgBuffer {
    pub fn copy_from(data: &[u8]) -> Result<Self> {
        if data.len() > ARG_BUFFER_SIZE {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                max: ARG_BUFFER_SIZE,
            });
        }
        let mut bytes = [0u8; ARG_BUFFER_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Ok(ArgBuffer {
            bytes,
            len: data.len(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        self.bytes.as_mut_ptr().cast()
    }
}

/// What a task runs.
pub(crate) enum TaskBody {
    Closure(Box<dyn FnOnce(&Context) + Send + 'static>),
    Raw { func: RawTaskFn, args: ArgBuffer },
    Foreign { func: ForeignTaskFn, args: ArgBuffer },
}

impl TaskBody {
    pub(crate) fn run(self, ctx: &Context) {
        match self {
            TaskBody::Closure(work) => work(ctx),
            TaskBody::Raw { func, args } => func(ctx, args.as_bytes()),
            TaskBody::Foreign { func, mut args } => {
                // SAFETY: `mir_task_create` requires `func` to accept a
                // pointer to a copy of the payload it was given.
                unsafe { func(args.as_mut_ptr()) }
            }
        }
    }
}

/// Validates a task name.
pub fn check_name(name: &str) -> Result<()> {
    if name.len() >= SHORT_NAME_LEN {
        return Err(Error::NameTooLong {
            name: name.to_string(),
            max: SHORT_NAME_LEN - 1,
        });
    }
    Ok(())
}

/// A schedulable unit of work.
pub struct Task {
    id: TaskId,
    name: Option<Box<str>>,
    parent: Option<TaskId>,
    depth: u32,
    body: Option<TaskBody>,
    footprints: Vec<Footprint>,
    twc: Arc<TaskWaitCounter>,
    signal: Option<Arc<AtomicBool>>,
    comm_cost: Option<u64>,
    taken: AtomicBool,
    created: Instant,
}

/// Everything needed to build a [`Task`].
pub(crate) struct TaskParts {
    pub id: TaskId,
    pub name: Option<Box<str>>,
    pub parent: Option<TaskId>,
    pub depth: u32,
    pub body: TaskBody,
    pub footprints: Vec<Footprint>,
    pub twc: Arc<TaskWaitCounter>,
    pub signal: Option<Arc<AtomicBool>>,
}

impl Task {
    /// Builds a task. The caller has already registered it with `parts.twc`.
    pub(crate) fn new(parts: TaskParts) -> Box<Task> {
        Box::new(Task {
            id: parts.id,
            name: parts.name,
            parent: parts.parent,
            depth: parts.depth,
            body: Some(parts.body),
            footprints: parts.footprints,
            twc: parts.twc,
            signal: parts.signal,
            comm_cost: None,
            taken: AtomicBool::new(false),
            created: Instant::now(),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    /// Nesting depth; top-level tasks are at depth 0.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn footprints(&self) -> &[Footprint] {
        &self.footprints
    }

    /// Estimated access cost, once computed by placement or at pop time.
    pub fn comm_cost(&self) -> Option<u64> {
        self.comm_cost
    }

    pub(crate) fn set_comm_cost(&mut self, cost: u64) {
        self.comm_cost = Some(cost);
    }

    pub(crate) fn created(&self) -> Instant {
        self.created
    }

    /// Marks the task as taken by a scheduler; false if it already was.
    pub(crate) fn claim(&self) -> bool {
        self.taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn take_body(&mut self) -> Option<TaskBody> {
        self.body.take()
    }

    /// Epilog: folds the completion into the wait counter, then raises the
    /// done signal if anyone holds a handle.
    pub(crate) fn finish(&self, worker: usize) {
        self.twc.complete(worker);
        if let Some(signal) = &self.signal {
            signal.store(true, Ordering::Release);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("depth", &self.depth)
            .field("footprints", &self.footprints.len())
            .finish()
    }
}

/// Completion flag of one task, returned by
/// [`TaskBuilder::spawn_handle`](crate::context::TaskBuilder::spawn_handle).
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    done: Arc<AtomicBool>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, done: Arc<AtomicBool>) -> Self {
        TaskHandle { id, done }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}
