//! Runtime configuration.
//!
//! Settings come from the `MIR_CONF` environment variable, a space-separated
//! option string parsed with clap, and from `MIR_WORKER_CPU_MAP`, a
//! comma-separated list of cores, one per worker.

use crate::error::{Error, Result};
use crate::policy::PolicyKind;
use crate::queue::DEFAULT_CAPACITY;
use crate::topology::Arch;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Hard upper bound on the number of workers.
pub const MAX_WORKERS: usize = 100;

/// Worker threads get this many times the platform default stack size.
pub const WORKER_STACK_SIZE_MULTIPLIER: usize = 10;

/// Default stack size of a spawned Rust thread.
const THREAD_DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

pub const CONF_VAR: &str = "MIR_CONF";
pub const CPU_MAP_VAR: &str = "MIR_WORKER_CPU_MAP";

/// Strategy for pinning worker threads to CPU cores.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    None,
    /// Worker `i` is pinned to the OS cpu of its core. Failure is fatal.
    #[default]
    Linear,
}

/// Memory allocation policy. Recorded and reported; placement of memory
/// itself is the job of the embedding program's allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryPolicy {
    #[default]
    Coarse,
    Fine,
    System,
    Local,
}

impl MemoryPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryPolicy::Coarse => "coarse",
            MemoryPolicy::Fine => "fine",
            MemoryPolicy::System => "system",
            MemoryPolicy::Local => "local",
        }
    }
}

impl FromStr for MemoryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coarse" => Ok(MemoryPolicy::Coarse),
            "fine" => Ok(MemoryPolicy::Fine),
            "system" => Ok(MemoryPolicy::System),
            "local" => Ok(MemoryPolicy::Local),
            other => Err(Error::UnknownMemoryPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for MemoryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of workers, including the creating thread. Defaults to one per core.
    pub workers: Option<usize>,
    pub policy: PolicyKind,
    pub memory_policy: MemoryPolicy,
    /// Worker stack size in MB.
    pub stack_size_mb: Option<usize>,
    /// Inline new tasks once this many tasks per worker are queued. 0 disables.
    pub inlining_limit: usize,
    pub queue_capacity: usize,
    /// Footprint size in bytes below which `numa` ignores data placement.
    pub numa_footprint: Option<u64>,
    pub worker_stats: bool,
    pub task_stats: bool,
    pub recorder: bool,
    /// Run a task on the spot when its queue is full instead of aborting.
    pub inline_when_full: bool,
    pub pinning: PinningStrategy,
    /// Core of each worker. Defaults to worker `i` on core `i`.
    pub cpu_map: Option<Vec<usize>>,
    /// Predefined machine to use instead of host detection.
    pub arch: Option<String>,
    /// Debug builds only: panic when a wait makes no progress for this long
    /// while nothing is runnable.
    pub liveness_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: None,
            policy: PolicyKind::default(),
            memory_policy: MemoryPolicy::default(),
            stack_size_mb: None,
            inlining_limit: 0,
            queue_capacity: DEFAULT_CAPACITY,
            numa_footprint: None,
            worker_stats: false,
            task_stats: false,
            recorder: false,
            inline_when_full: true,
            pinning: PinningStrategy::default(),
            cpu_map: None,
            arch: None,
            liveness_timeout: None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "MIR_CONF",
    about = "Valid options in the MIR_CONF environment variable",
    disable_version_flag = true
)]
struct ConfArgs {
    /// Number of workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Task scheduling policy: central, central-stack, ws, ws-de, ws-de-node or numa
    #[arg(short, long)]
    schedule: Option<String>,

    /// Memory allocation policy: coarse, fine, system or local
    #[arg(short, long = "memory-policy")]
    memory_policy: Option<String>,

    /// Task inlining limit based on number of queued tasks per worker
    #[arg(long = "inlining-limit")]
    inlining_limit: Option<usize>,

    /// Worker stack size in MB
    #[arg(long = "stack-size", value_name = "MB")]
    stack_size: Option<usize>,

    /// Task queue capacity
    #[arg(long = "queue-size")]
    queue_size: Option<usize>,

    /// Data footprint size in bytes below which the numa policy keeps a task local
    #[arg(long = "numa-footprint")]
    numa_footprint: Option<u64>,

    /// Collect worker statistics
    #[arg(long = "worker-stats")]
    worker_stats: bool,

    /// Collect task statistics
    #[arg(long = "task-stats")]
    task_stats: bool,

    /// Enable the worker state recorder
    #[arg(short, long)]
    recorder: bool,

    /// Abort instead of running a task inline when its queue is full
    #[arg(long = "no-inline-when-full")]
    no_inline_when_full: bool,

    /// Worker to core pinning
    #[arg(long, value_enum)]
    pinning: Option<PinningStrategy>,

    /// Use a predefined machine description instead of host detection
    #[arg(long)]
    arch: Option<String>,
}

impl Config {
    /// Parses a `MIR_CONF` option string on top of the defaults.
    ///
    /// `-h` prints the option summary to stderr and leaves the defaults.
    pub fn parse(conf: &str) -> Result<Config> {
        let mut config = Config::default();
        config.apply(conf)?;
        Ok(config)
    }

    /// Reads `MIR_CONF` and `MIR_WORKER_CPU_MAP`.
    pub fn from_env() -> Result<Config> {
        let mut config = Config::default();
        if let Ok(conf) = std::env::var(CONF_VAR) {
            config.apply(&conf)?;
        }
        if let Ok(map) = std::env::var(CPU_MAP_VAR) {
            config.cpu_map = Some(parse_cpu_map(&map)?);
        }
        Ok(config)
    }

    fn apply(&mut self, conf: &str) -> Result<()> {
        let argv = std::iter::once(CONF_VAR).chain(conf.split_whitespace());
        let args = match ConfArgs::try_parse_from(argv) {
            Ok(args) => args,
            Err(err) if err.kind() == clap::error::ErrorKind::DisplayHelp => {
                eprintln!("{err}");
                return Ok(());
            }
            Err(err) => return Err(Error::InvalidConfig(err.to_string())),
        };

        if let Some(workers) = args.workers {
            if workers == 0 {
                return Err(Error::NoWorkers);
            }
            self.workers = Some(workers);
        }
        if let Some(name) = args.schedule {
            self.policy = name.parse()?;
        }
        if let Some(name) = args.memory_policy {
            self.memory_policy = name.parse()?;
        }
        if let Some(limit) = args.inlining_limit {
            self.inlining_limit = limit;
        }
        if let Some(mb) = args.stack_size {
            if mb == 0 {
                return Err(Error::InvalidConfig(
                    "stack size should be greater than 0".into(),
                ));
            }
            self.stack_size_mb = Some(mb);
            self.worker_stack_size()?;
        }
        if let Some(capacity) = args.queue_size {
            if capacity == 0 {
                return Err(Error::InvalidConfig(
                    "queue capacity should be greater than 0".into(),
                ));
            }
            self.queue_capacity = capacity;
        }
        if let Some(bytes) = args.numa_footprint {
            if bytes == 0 {
                return Err(Error::InvalidConfig(
                    "numa footprint should be greater than 0".into(),
                ));
            }
            self.numa_footprint = Some(bytes);
        }
        self.worker_stats |= args.worker_stats;
        self.task_stats |= args.task_stats;
        self.recorder |= args.recorder;
        if args.no_inline_when_full {
            self.inline_when_full = false;
        }
        if let Some(pinning) = args.pinning {
            self.pinning = pinning;
        }
        if let Some(arch) = args.arch {
            self.arch = Some(arch);
        }

        debug!(config = ?self, "parsed {}", CONF_VAR);
        Ok(())
    }

    /// Stack size of spawned worker threads.
    pub fn worker_stack_size(&self) -> Result<usize> {
        match self.stack_size_mb {
            Some(mb) => mb.checked_mul(1024 * 1024).ok_or_else(|| {
                Error::InvalidConfig(format!("stack size of {mb} MB is out of range"))
            }),
            None => Ok(THREAD_DEFAULT_STACK_SIZE * WORKER_STACK_SIZE_MULTIPLIER),
        }
    }

    /// Resolves the worker count and the core of every worker against `arch`.
    pub fn placement(&self, arch: &Arch) -> Result<Vec<usize>> {
        let cores = arch.num_cores();
        let workers = self.workers.unwrap_or(cores.min(MAX_WORKERS));
        if workers == 0 {
            return Err(Error::NoWorkers);
        }
        if workers > cores || workers > MAX_WORKERS {
            return Err(Error::TooManyWorkers {
                workers,
                cores: cores.min(MAX_WORKERS),
            });
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue capacity should be greater than 0".into(),
            ));
        }

        match &self.cpu_map {
            None => Ok((0..workers).collect()),
            Some(map) => {
                if map.len() != workers {
                    return Err(Error::CpuMapMismatch {
                        found: map.len(),
                        workers,
                    });
                }
                if let Some(&core) = map.iter().find(|&&core| core >= cores) {
                    return Err(Error::InvalidCpu {
                        core,
                        arch: arch.name().to_string(),
                        cores,
                    });
                }
                Ok(map.clone())
            }
        }
    }
}

/// Parses a comma-separated core list such as `0,2,4,6`.
pub fn parse_cpu_map(s: &str) -> Result<Vec<usize>> {
    s.split(',')
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            tok.parse::<usize>().map_err(|_| {
                Error::InvalidConfig(format!("`{tok}` in {CPU_MAP_VAR} is not a core id"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arch4() -> Arch {
        Arch::uniform("fixture", 4)
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.policy, PolicyKind::CentralStack);
        assert_eq!(config.queue_capacity, 4096);
        assert!(config.inline_when_full);
        assert_eq!(config.pinning, PinningStrategy::Linear);
        assert_eq!(config.placement(&arch4()).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parse_full_string() {
        let config = Config::parse(
            "-w 2 -s ws-de -m fine --inlining-limit=8 --stack-size=4 --queue-size=64 \
             --numa-footprint=1024 --worker-stats --task-stats -r --no-inline-when-full \
             --pinning=none --arch=adk",
        )
        .unwrap();
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.policy, PolicyKind::WsDe);
        assert_eq!(config.memory_policy, MemoryPolicy::Fine);
        assert_eq!(config.inlining_limit, 8);
        assert_eq!(config.worker_stack_size().unwrap(), 4 * 1024 * 1024);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.numa_footprint, Some(1024));
        assert!(config.worker_stats && config.task_stats && config.recorder);
        assert!(!config.inline_when_full);
        assert_eq!(config.pinning, PinningStrategy::None);
        assert_eq!(config.arch.as_deref(), Some("adk"));
    }

    #[test]
    fn test_long_forms() {
        let config = Config::parse("--workers 3 --schedule numa --memory-policy=system").unwrap();
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.policy, PolicyKind::Numa);
        assert_eq!(config.memory_policy, MemoryPolicy::System);
    }

    #[test]
    fn test_fatal_values() {
        assert!(matches!(
            Config::parse("-s fifo"),
            Err(Error::UnknownPolicy(name)) if name == "fifo"
        ));
        assert!(matches!(
            Config::parse("-m magic"),
            Err(Error::UnknownMemoryPolicy(_))
        ));
        assert!(matches!(Config::parse("-w 0"), Err(Error::NoWorkers)));
        assert!(matches!(
            Config::parse("--queue-size=0"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::parse("--bogus"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::parse("-w many"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_stack_size_overflow() {
        let conf = format!("--stack-size={}", usize::MAX / 1024);
        assert!(matches!(Config::parse(&conf), Err(Error::InvalidConfig(_))));

        let config = Config {
            stack_size_mb: Some(usize::MAX),
            ..Config::default()
        };
        assert!(config.worker_stack_size().unwrap_err().is_config());
    }

    #[test]
    fn test_help_is_not_an_error() {
        assert_eq!(Config::parse("-h").unwrap(), Config::default());
    }

    #[test]
    fn test_placement_errors() {
        let arch = arch4();
        let config = Config {
            workers: Some(5),
            ..Config::default()
        };
        assert!(matches!(
            config.placement(&arch),
            Err(Error::TooManyWorkers { workers: 5, cores: 4 })
        ));

        let config = Config {
            workers: Some(2),
            cpu_map: Some(vec![3]),
            ..Config::default()
        };
        assert!(matches!(
            config.placement(&arch),
            Err(Error::CpuMapMismatch { found: 1, workers: 2 })
        ));

        let config = Config {
            workers: Some(2),
            cpu_map: Some(vec![3, 9]),
            ..Config::default()
        };
        assert!(matches!(
            config.placement(&arch),
            Err(Error::InvalidCpu { core: 9, .. })
        ));

        let config = Config {
            workers: Some(2),
            cpu_map: Some(vec![3, 1]),
            ..Config::default()
        };
        assert_eq!(config.placement(&arch).unwrap(), vec![3, 1]);
    }

    #[test]
    fn test_cpu_map_parsing() {
        assert_eq!(parse_cpu_map("0,2, 4,6").unwrap(), vec![0, 2, 4, 6]);
        assert_eq!(parse_cpu_map("").unwrap(), Vec::<usize>::new());
        assert!(matches!(
            parse_cpu_map("0,x"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_memory_policy_names() {
        assert_eq!(MemoryPolicy::Local.to_string(), "local");
        assert_eq!("coarse".parse::<MemoryPolicy>().unwrap(), MemoryPolicy::Coarse);
    }
}
