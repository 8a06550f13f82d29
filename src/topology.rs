//! Machine topology: cores, NUMA nodes, inter-node cost and hop distance.
//!
//! An [`Arch`] is immutable once built. It is selected at startup by matching
//! the host name against the predefined [`machines`](crate::machines) table;
//! unknown hosts get a single-node model covering every cpu the OS reports.

use serde::Serialize;
use sysinfo::{CpuRefreshKind, System};
use tracing::debug;

/// Cost of touching memory on the local node.
pub const LOCAL_COST: u32 = 10;

/// Static description of a machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Arch {
    name: String,
    num_nodes: usize,
    diameter: usize,
    llc_size_kb: usize,
    core_nodes: Vec<usize>,
    sys_cpus: Vec<usize>,
    node_cores: Vec<Vec<usize>>,
    costs: Vec<u32>,
    hops: Vec<usize>,
    /// `vicinity[node][d - 1]`: the steal victims of `node` at distance `d`.
    vicinity: Vec<Vec<Vec<usize>>>,
}

impl Arch {
    /// Starts describing a machine with `num_nodes` NUMA nodes.
    pub fn builder(name: impl Into<String>, num_nodes: usize) -> ArchBuilder {
        ArchBuilder::new(name.into(), num_nodes)
    }

    /// A single-node machine with `cores` cores and a uniform cost.
    pub fn uniform(name: impl Into<String>, cores: usize) -> Arch {
        Arch::builder(name, 1)
            .cores_per_node(cores.max(1))
            .llc_size_kb(1024)
            .build()
    }

    /// Looks up a predefined machine by name.
    pub fn by_name(name: &str) -> Option<Arch> {
        crate::machines::lookup(name)
    }

    /// Picks the machine model for the current host.
    pub fn detect() -> Arch {
        let host = System::host_name().unwrap_or_default();
        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        let os_cpus = match system.cpus().len() {
            0 => num_cpus::get(),
            n => n,
        };
        Arch::select(&host, os_cpus)
    }

    /// Matches `host` against the predefined table, else falls back to a
    /// single node with `os_cpus` cores.
    pub fn select(host: &str, os_cpus: usize) -> Arch {
        match crate::machines::lookup(host) {
            Some(arch) => {
                debug!(arch = arch.name(), "selected predefined architecture");
                arch
            }
            None => {
                debug!(host, os_cpus, "unknown host, using single-node architecture");
                Arch::uniform(host_or_default(host), os_cpus)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_cores(&self) -> usize {
        self.core_nodes.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Largest hop distance between any two nodes.
    pub fn diameter(&self) -> usize {
        self.diameter
    }

    pub fn llc_size_kb(&self) -> usize {
        self.llc_size_kb
    }

    pub fn cores_per_node(&self) -> usize {
        (self.num_cores() / self.num_nodes).max(1)
    }

    pub fn node_of(&self, core: usize) -> usize {
        self.core_nodes[core]
    }

    /// Maps a logical core to the OS cpu id used for pinning.
    pub fn sys_cpu_of(&self, core: usize) -> usize {
        self.sys_cpus[core]
    }

    pub fn cores_of(&self, node: usize) -> &[usize] {
        &self.node_cores[node]
    }

    /// Relative cost of accessing memory on node `to` from node `from`.
    pub fn comm_cost(&self, from: usize, to: usize) -> u32 {
        self.costs[from * self.num_nodes + to]
    }

    pub fn hops(&self, from: usize, to: usize) -> usize {
        self.hops[from * self.num_nodes + to]
    }

    /// Nodes to search at hop distance `distance` from `node`: by default
    /// those exactly that many hops away. A machine table may list its own
    /// rings, which can also repeat nodes reachable over a longer route.
    pub fn vicinity(&self, node: usize, distance: usize) -> &[usize] {
        if distance == 0 || distance > self.diameter {
            return &[];
        }
        &self.vicinity[node][distance - 1]
    }
}

fn host_or_default(host: &str) -> &str {
    if host.is_empty() { "this" } else { host }
}

type CostFn = Box<dyn Fn(usize, usize) -> u32>;
type HopFn = Box<dyn Fn(usize, usize) -> usize>;
type VicinityFn = Box<dyn Fn(usize, usize) -> Vec<usize>>;

/// Builder for [`Arch`], used by the machine table and by test fixtures.
pub struct ArchBuilder {
    name: String,
    num_nodes: usize,
    llc_size_kb: usize,
    core_nodes: Vec<usize>,
    sys_cpus: Option<Vec<usize>>,
    cost: CostFn,
    hops: HopFn,
    vicinity: Option<VicinityFn>,
}

impl ArchBuilder {
    fn new(name: String, num_nodes: usize) -> Self {
        assert!(num_nodes > 0, "an architecture needs at least one node");
        ArchBuilder {
            name,
            num_nodes,
            llc_size_kb: 1024,
            core_nodes: Vec::new(),
            sys_cpus: None,
            cost: Box::new(|a, b| if a == b { LOCAL_COST } else { 2 * LOCAL_COST }),
            hops: Box::new(|a, b| usize::from(a != b)),
            vicinity: None,
        }
    }

    /// Assigns `n` consecutive cores to each node.
    pub fn cores_per_node(mut self, n: usize) -> Self {
        self.core_nodes = (0..self.num_nodes)
            .flat_map(|node| std::iter::repeat_n(node, n))
            .collect();
        self
    }

    /// Explicit core to node assignment.
    pub fn core_nodes(mut self, nodes: Vec<usize>) -> Self {
        self.core_nodes = nodes;
        self
    }

    /// OS cpu ids for each logical core. Defaults to the identity.
    pub fn sys_cpus(mut self, cpus: Vec<usize>) -> Self {
        self.sys_cpus = Some(cpus);
        self
    }

    pub fn llc_size_kb(mut self, kb: usize) -> Self {
        self.llc_size_kb = kb;
        self
    }

    pub fn cost(mut self, f: impl Fn(usize, usize) -> u32 + 'static) -> Self {
        self.cost = Box::new(f);
        self
    }

    pub fn hops(mut self, f: impl Fn(usize, usize) -> usize + 'static) -> Self {
        self.hops = Box::new(f);
        self
    }

    /// Explicit victim rings: `f(node, distance)` for every distance up to
    /// the diameter. Without it the rings are derived from [`hops`](Self::hops).
    pub fn vicinity(mut self, f: impl Fn(usize, usize) -> Vec<usize> + 'static) -> Self {
        self.vicinity = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arch {
        let n = self.num_nodes;
        assert!(!self.core_nodes.is_empty(), "an architecture needs cores");
        assert!(
            self.core_nodes.iter().all(|&node| node < n),
            "core assigned to a node outside 0..{}",
            n
        );

        let sys_cpus = self
            .sys_cpus
            .unwrap_or_else(|| (0..self.core_nodes.len()).collect());
        assert_eq!(sys_cpus.len(), self.core_nodes.len());

        let mut node_cores = vec![Vec::new(); n];
        for (core, &node) in self.core_nodes.iter().enumerate() {
            node_cores[node].push(core);
        }

        let mut costs = Vec::with_capacity(n * n);
        let mut hops = Vec::with_capacity(n * n);
        for a in 0..n {
            for b in 0..n {
                costs.push((self.cost)(a, b));
                hops.push(if a == b { 0 } else { (self.hops)(a, b) });
            }
        }
        let diameter = hops.iter().copied().max().unwrap_or(0);

        let vicinity = (0..n)
            .map(|node| {
                (1..=diameter)
                    .map(|d| match &self.vicinity {
                        Some(f) => f(node, d),
                        None => (0..n).filter(|&other| hops[node * n + other] == d).collect(),
                    })
                    .collect()
            })
            .collect();

        Arch {
            name: self.name,
            num_nodes: n,
            diameter,
            llc_size_kb: self.llc_size_kb,
            core_nodes: self.core_nodes,
            sys_cpus,
            node_cores,
            costs,
            hops,
            vicinity,
        }
    }
}

/// Placement of workers on cores and nodes.
#[derive(Debug, Clone)]
pub struct WorkerMap {
    cores: Vec<usize>,
    nodes: Vec<usize>,
    by_node: Vec<Vec<usize>>,
}

impl WorkerMap {
    /// Worker `i` runs on `cores[i]`.
    pub fn new(arch: &Arch, cores: &[usize]) -> Self {
        let nodes: Vec<usize> = cores.iter().map(|&core| arch.node_of(core)).collect();
        let mut by_node = vec![Vec::new(); arch.num_nodes()];
        for (worker, &node) in nodes.iter().enumerate() {
            by_node[node].push(worker);
        }
        WorkerMap {
            cores: cores.to_vec(),
            nodes,
            by_node,
        }
    }

    /// Worker `i` runs on core `i`.
    pub fn identity(arch: &Arch, workers: usize) -> Self {
        let cores: Vec<usize> = (0..workers).collect();
        WorkerMap::new(arch, &cores)
    }

    pub fn num_workers(&self) -> usize {
        self.cores.len()
    }

    pub fn core_of(&self, worker: usize) -> usize {
        self.cores[worker]
    }

    pub fn node_of(&self, worker: usize) -> usize {
        self.nodes[worker]
    }

    /// Workers bound to cores of `node`.
    pub fn workers_on(&self, node: usize) -> &[usize] {
        &self.by_node[node]
    }
}
