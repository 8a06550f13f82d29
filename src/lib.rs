//! # MIR - Task-Parallel Runtime
//!
//! A runtime for fine-grained task parallelism in the style of OpenMP tasks.
//! Tasks are created from the program or from other tasks, scheduled over a
//! pool of pinned worker threads by a pluggable policy, and joined with
//! task wait counters. A waiting worker never sleeps: it runs other tasks
//! until the ones it waits for are done.
//!
//! ## Architecture
//!
//! - **Tasks**: a closure or a function with a copied argument buffer, plus
//!   optional data footprints describing the memory it touches
//! - **Task wait counters**: per-parent fan-in counters, tallied per worker
//! - **Scheduling policies**: central queue, central stack, work stealing
//!   over queues or Chase-Lev deques, and NUMA-aware placement by footprint
//! - **Architecture model**: cores, nodes, inter-node cost and hop distance,
//!   detected from the host or selected from built-in machine tables
//! - **Workers**: one OS thread per core; the creating thread is worker 0
//!
//! ## Example
//!
//! ```no_run
//! use mir::{Context, Runtime};
//!
//! fn fib(ctx: &Context, n: u64) -> u64 {
//!     if n < 2 {
//!         return n;
//!     }
//!     let (tx, rx) = std::sync::mpsc::channel();
//!     ctx.spawn(move |ctx| {
//!         let _ = tx.send(fib(ctx, n - 1));
//!     });
//!     let b = fib(ctx, n - 2);
//!     ctx.wait();
//!     rx.recv().unwrap() + b
//! }
//!
//! let rt = Runtime::from_env().unwrap();
//! println!("fib(20) = {}", fib(&rt.context(), 20));
//! rt.destroy().unwrap();
//! ```

pub mod c_api;
pub mod config;
pub mod context;
pub mod dequeue;
pub mod error;
pub mod footprint;
pub mod lock;
pub mod machines;
pub mod policy;
pub mod queue;
pub mod recorder;
pub mod runtime;
pub mod stack;
pub mod stats;
pub mod task;
pub mod topology;
pub mod twc;
pub mod worker;

pub use config::{Config, MemoryPolicy, PinningStrategy};
pub use context::{Context, TaskBuilder, with_current};
pub use error::{Error, Result};
pub use footprint::{Access, Footprint, MemoryLocator, RegionMap};
pub use policy::{PolicyKind, SchedulingPolicy};
pub use runtime::{Builder, Report, Runtime};
pub use task::{Task, TaskHandle, TaskId};
pub use topology::{Arch, WorkerMap};
pub use twc::TaskWaitCounter;
