//! C entry points.
//!
//! A C program calls `mir_create` once on its main thread, creates tasks
//! from there or from inside tasks, and calls `mir_destroy` at the end.
//! Every error is fatal here: it is logged and the process aborts.

use crate::context::{Context, with_current};
use crate::error::{Error, fatal};
use crate::footprint::Footprint;
use crate::recorder;
use crate::runtime::Runtime;
use crate::stats;
use crate::task::{ForeignTaskFn, TaskHandle};
use crate::twc::TaskWaitCounter;
use std::cell::RefCell;
use std::ffi::{CStr, c_char, c_int, c_void};
use std::sync::Arc;
use std::slice;
use tracing::{error, info};

thread_local! {
    /// The runtime created on this thread and how many `mir_create` calls
    /// it has outstanding.
    static RUNTIME: RefCell<Option<(Runtime, usize)>> = const { RefCell::new(None) };
}

/// Opaque task handle returned by [`mir_task_create`].
pub struct MirTask(TaskHandle);

/// Opaque wait counter returned by [`mir_twc_create`].
pub struct MirTwc(Arc<TaskWaitCounter>);

fn current<R>(f: impl FnOnce(&Context<'_>) -> R) -> R {
    with_current(f).unwrap_or_else(|| fatal(Error::NoContext))
}

/// Creates the runtime, configured by `MIR_CONF`, with the calling thread
/// as worker 0. Nested calls on the same thread only count references.
#[unsafe(no_mangle)]
pub extern "C" fn mir_create() {
    RUNTIME.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some((_, refs)) = slot.as_mut() {
            *refs += 1;
            return;
        }
        let runtime = Runtime::from_env().unwrap_or_else(|err| fatal(err));
        *slot = Some((runtime, 1));
    });
}

/// Waits for all tasks and stops the runtime once the last reference goes.
/// Writes the statistics and trace files that were enabled to the current
/// directory.
#[unsafe(no_mangle)]
pub extern "C" fn mir_destroy() {
    let runtime = RUNTIME.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some((_, refs)) if *refs > 1 => {
                *refs -= 1;
                None
            }
            _ => slot.take().map(|(runtime, _)| runtime),
        }
    });
    let Some(runtime) = runtime else {
        return;
    };
    let config = runtime.config().clone();
    let report = runtime.destroy().unwrap_or_else(|err| fatal(err));
    if let Err(err) = report.write_enabled(&config, ".") {
        error!("cannot write runtime report: {err}");
    }
    if config.worker_stats {
        info!(file = stats::WORKER_STATS_FILE, "worker statistics written");
    }
    if config.recorder {
        info!(file = recorder::TRACE_FILE, "recorder trace written");
    }
}

/// Creates a task running `tfunc` on a private copy of `data_size` bytes at
/// `data`.
///
/// The task joins `twc` when it is not null, the calling task's children
/// otherwise. The returned handle can be passed to [`mir_task_wait`] and must
/// be released with [`mir_task_destroy`].
///
/// # Safety
///
/// `data` must be readable for `data_size` bytes, `data_footprints` must
/// point to `num_data_footprints` valid footprints, `name` must be null or a
/// NUL-terminated string, and `twc` must be null or come from
/// [`mir_twc_create`]. `tfunc` receives a pointer to the copy, aligned to
/// 16 bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mir_task_create(
    tfunc: ForeignTaskFn,
    data: *const c_void,
    data_size: usize,
    twc: *const MirTwc,
    num_data_footprints: u32,
    data_footprints: *const Footprint,
    name: *const c_char,
) -> *mut MirTask {
    let args: &[u8] = if data.is_null() || data_size == 0 {
        &[]
    } else {
        // SAFETY: the caller guarantees `data` is readable for `data_size` bytes.
        unsafe { slice::from_raw_parts(data.cast(), data_size) }
    };
    let footprints: &[Footprint] = if data_footprints.is_null() || num_data_footprints == 0 {
        &[]
    } else {
        // SAFETY: the caller guarantees the array holds `num_data_footprints` entries.
        unsafe { slice::from_raw_parts(data_footprints, num_data_footprints as usize) }
    };
    let name = if name.is_null() {
        None
    } else {
        // SAFETY: the caller guarantees a NUL-terminated string.
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    };
    // SAFETY: the caller guarantees `twc` is null or from `mir_twc_create`.
    let twc = unsafe { twc.as_ref() };

    let handle = current(|ctx| {
        let mut builder = ctx
            .foreign_task(tfunc, args)
            .unwrap_or_else(|err| fatal(err))
            .footprints(footprints.iter().copied());
        if let Some(name) = name {
            builder = builder.name(name);
        }
        if let Some(MirTwc(twc)) = twc {
            builder = builder.in_twc(twc);
        }
        builder.spawn_handle().unwrap_or_else(|err| fatal(err))
    });
    Box::into_raw(Box::new(MirTask(handle)))
}

/// Releases a handle from [`mir_task_create`]. The task itself is unaffected.
///
/// # Safety
///
/// `task` must be null or a handle not yet released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mir_task_destroy(task: *mut MirTask) {
    if !task.is_null() {
        // SAFETY: the handle was boxed by `mir_task_create`.
        drop(unsafe { Box::from_raw(task) });
    }
}

/// Waits for `task`, or for every child of the calling task when `task` is
/// null, running other tasks meanwhile.
///
/// # Safety
///
/// `task` must be null or a live handle from [`mir_task_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mir_task_wait(task: *const MirTask) {
    // SAFETY: the caller guarantees the handle is live.
    match unsafe { task.as_ref() } {
        Some(MirTask(handle)) => current(|ctx| ctx.wait_for(handle)),
        None => current(|ctx| ctx.wait()),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mir_twc_create() -> *mut MirTwc {
    let twc = current(|ctx| ctx.twc());
    Box::into_raw(Box::new(MirTwc(twc)))
}

/// # Safety
///
/// `twc` must be null or a counter not yet released. Tasks created into it
/// keep it alive until they finish.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mir_twc_destroy(twc: *mut MirTwc) {
    if !twc.is_null() {
        // SAFETY: the counter was boxed by `mir_twc_create`.
        drop(unsafe { Box::from_raw(twc) });
    }
}

/// Waits until every task created into `twc` has finished.
///
/// # Safety
///
/// `twc` must be a live counter from [`mir_twc_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mir_task_wait_twc(twc: *const MirTwc) {
    // SAFETY: the caller guarantees the counter is live.
    if let Some(MirTwc(twc)) = unsafe { twc.as_ref() } {
        current(|ctx| ctx.wait_on(twc));
    }
}

/// Number of workers, or 0 when called outside the runtime.
#[unsafe(no_mangle)]
pub extern "C" fn mir_get_num_workers() -> c_int {
    with_current(|ctx| ctx.num_workers() as c_int).unwrap_or(0)
}

/// Worker running the caller, or -1 outside the runtime.
#[unsafe(no_mangle)]
pub extern "C" fn mir_get_worker_id() -> c_int {
    with_current(|ctx| ctx.worker_id() as c_int).unwrap_or(-1)
}
