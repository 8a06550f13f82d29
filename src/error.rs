//! Error types for the runtime.
//!
//! Every variant is fatal for the operation that produced it. Configuration
//! errors surface from [`Runtime`](crate::Runtime) construction; per-task
//! misuse surfaces from the raw spawn API.

use std::{io, process};
use tracing::error;

/// Errors reported by the runtime.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(
        "unknown scheduling policy `{0}` (choose among central, central-stack, ws, ws-de, ws-de-node and numa)"
    )]
    UnknownPolicy(String),

    #[error("unknown memory policy `{0}` (choose among coarse, fine, system and local)")]
    UnknownMemoryPolicy(String),

    #[error("unknown architecture `{0}`")]
    UnknownArch(String),

    /// A malformed or out-of-range `MIR_CONF` value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot configure more workers ({workers}) than cores ({cores})")]
    TooManyWorkers { workers: usize, cores: usize },

    #[error("at least one worker is required")]
    NoWorkers,

    #[error("MIR_WORKER_CPU_MAP lists {found} cpus but {workers} workers are configured")]
    CpuMapMismatch { found: usize, workers: usize },

    #[error("core {core} is outside architecture `{arch}` ({cores} cores)")]
    InvalidCpu {
        core: usize,
        arch: String,
        cores: usize,
    },

    #[error("cannot bind worker {worker} to cpu {cpu}")]
    PinningFailed { worker: usize, cpu: usize },

    #[error("task payload of {size} bytes exceeds the {max}-byte argument buffer")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("task name `{name}` is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },

    /// Raised when a queue is full and inlining is disabled. Aborts the
    /// process when it happens.
    #[error("cannot enqueue task: queue capacity {capacity} reached, increase it with --queue-size")]
    QueueFull { capacity: usize },

    #[error("worker {worker} does not exist (runtime has {workers} workers)")]
    NoSuchWorker { worker: usize, workers: usize },

    /// The calling thread is already worker 0 of another runtime, or a
    /// worker of one.
    #[error("a runtime is already active on this thread")]
    RuntimeActive,

    /// The calling thread is not a worker of a live runtime.
    #[error("no runtime is active on this thread")]
    NoContext,

    #[error("cannot spawn worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),

    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Logs `err` and aborts the process. For errors that must not be caught
/// by a task's panic isolation.
pub(crate) fn fatal(err: Error) -> ! {
    error!("{err}");
    eprintln!("MIR_ERR: {err}");
    process::abort()
}

impl Error {
    /// Returns true for errors raised while validating configuration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::UnknownPolicy(_)
                | Error::UnknownMemoryPolicy(_)
                | Error::UnknownArch(_)
                | Error::InvalidConfig(_)
                | Error::TooManyWorkers { .. }
                | Error::NoWorkers
                | Error::CpuMapMismatch { .. }
                | Error::InvalidCpu { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offending_value() {
        let err = Error::UnknownPolicy("fifo".into());
        assert!(err.to_string().contains("`fifo`"));

        let err = Error::TooManyWorkers {
            workers: 8,
            cores: 4,
        };
        assert_eq!(
            err.to_string(),
            "cannot configure more workers (8) than cores (4)"
        );
    }

    #[test]
    fn test_config_classification() {
        assert!(Error::NoWorkers.is_config());
        assert!(Error::InvalidConfig("x".into()).is_config());
        assert!(!Error::QueueFull { capacity: 1 }.is_config());
        assert!(!Error::WorkerPanicked(1).is_config());
    }
}
