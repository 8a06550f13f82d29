//! Predefined machine descriptions, matched against the host name at startup.

use crate::topology::{Arch, LOCAL_COST};

lazy_static::lazy_static! {
    static ref MACHINES: Vec<Arch> = vec![
        this(),
        adk(),
        gatti(),
        firenze(),
        gothmog(),
        tilepro64(),
    ];
}

/// Returns the predefined machine called `name`.
pub fn lookup(name: &str) -> Option<Arch> {
    MACHINES.iter().find(|arch| arch.name() == name).cloned()
}

/// Names of all predefined machines.
pub fn names() -> Vec<&'static str> {
    MACHINES.iter().map(|arch| arch.name()).collect()
}

/// Minimal two-core development box.
pub fn this() -> Arch {
    Arch::builder("this", 1)
        .cores_per_node(2)
        .llc_size_kb(1)
        .build()
}

pub fn adk() -> Arch {
    Arch::builder("adk", 1)
        .cores_per_node(4)
        .sys_cpus(vec![0, 2, 3, 6])
        .llc_size_kb(4096)
        .build()
}

pub fn gatti() -> Arch {
    Arch::builder("gatti", 1)
        .cores_per_node(4)
        .llc_size_kb(4096)
        .build()
}

pub fn firenze() -> Arch {
    Arch::builder("firenze", 1)
        .cores_per_node(2)
        .sys_cpus(vec![0, 2])
        .llc_size_kb(3072)
        .build()
}

/// Four-socket Opteron, two dies per socket: 8 nodes of 6 cores.
///
/// Dies on one socket (`n`, `n ^ 1`) are one hop apart, other dies with the
/// same parity two hops, the rest three. Costs come from `numactl --hardware`.
pub fn gothmog() -> Arch {
    Arch::builder("gothmog.it.kth.se", 8)
        .cores_per_node(6)
        .llc_size_kb(5000)
        .cost(|a, b| {
            if a == b {
                LOCAL_COST
            } else if a % 2 != b % 2 {
                22
            } else {
                16
            }
        })
        .hops(|a, b| {
            if a ^ 1 == b {
                1
            } else if a % 2 == b % 2 {
                2
            } else {
                3
            }
        })
        // Every die of the other parity is a three-hop victim, the socket
        // mate included.
        .vicinity(|node, distance| match distance {
            1 => vec![node ^ 1],
            2 => (0..8).filter(|&other| other != node && other % 2 == node % 2).collect(),
            _ => (0..8).filter(|&other| other % 2 != node % 2).collect(),
        })
        .build()
}

/// 8x8 tile mesh, one core per node.
pub fn tilepro64() -> Arch {
    fn manhattan(a: usize, b: usize) -> usize {
        (a / 8).abs_diff(b / 8) + (a % 8).abs_diff(b % 8)
    }

    Arch::builder("tilepro64", 64)
        .cores_per_node(1)
        .llc_size_kb(64)
        .cost(|a, b| {
            if a == b {
                LOCAL_COST
            } else {
                38 + 2 * manhattan(a, b) as u32
            }
        })
        .hops(manhattan)
        .build()
}
