//! Advisory data footprints and their distribution over NUMA nodes.
//!
//! A footprint never affects correctness. The NUMA scheduling policy uses the
//! node distribution of a task's READ footprints to pick the node with the
//! lowest access cost. Where memory actually lives is answered by a
//! [`MemoryLocator`], supplied by the embedding program.

use crate::lock::Lock;
use crate::topology::Arch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(C)]
pub enum Access {
    Read = 0,
    Write = 1,
}

/// A block of memory a task will touch.
///
/// The layout matches the C `mir_data_footprint_t` so the C entry points can
/// pass arrays of footprints through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Footprint {
    pub base: usize,
    pub element_size: usize,
    pub start: u64,
    pub end: u64,
    pub row_stride: u64,
    pub access: Access,
    /// Allocation the block belongs to, or 0.
    pub part_of: usize,
}

impl Footprint {
    /// Elements `start..=end` (in rows of `row_stride` elements) of the array at `base`.
    pub fn new(
        base: usize,
        element_size: usize,
        start: u64,
        end: u64,
        row_stride: u64,
        access: Access,
    ) -> Self {
        Footprint {
            base,
            element_size,
            start,
            end,
            row_stride,
            access,
            part_of: 0,
        }
    }

    /// The whole of `data`.
    pub fn of_slice<T>(data: &[T], access: Access) -> Self {
        let (start, end) = match data.len() {
            0 => (1, 0),
            n => (0, n as u64 - 1),
        };
        Footprint::new(
            data.as_ptr() as usize,
            std::mem::size_of::<T>(),
            start,
            end,
            1,
            access,
        )
    }

    pub fn with_part_of(mut self, part_of: usize) -> Self {
        self.part_of = part_of;
        self
    }

    /// Size of the block in bytes; 0 when it does not fit the address space.
    pub fn bytes(&self) -> usize {
        self.span().map_or(0, |span| span.len())
    }

    /// Address range covered by the footprint. A block that does not fit
    /// the address space yields an empty range at `base`.
    pub fn range(&self) -> Range<usize> {
        self.span().unwrap_or(self.base..self.base)
    }

    fn span(&self) -> Option<Range<usize>> {
        let row = usize::try_from(self.row_stride)
            .ok()?
            .checked_mul(self.element_size)?;
        let rows = self.end.checked_add(1)?.saturating_sub(self.start);
        let len = usize::try_from(rows).ok()?.checked_mul(row)?;
        let offset = usize::try_from(self.start).ok()?.checked_mul(row)?;
        let first = self.base.checked_add(offset)?;
        Some(first..first.checked_add(len)?)
    }
}

/// Answers where memory lives.
pub trait MemoryLocator: Send + Sync {
    /// Adds to `dist` the number of bytes of `range` resident on each node.
    fn accumulate(&self, range: Range<usize>, part_of: usize, dist: &mut NodeDistribution);
}

/// Explicit address-range to node registry.
///
/// Allocators register blocks as they place them; ranges never overlap.
#[derive(Debug, Default)]
pub struct RegionMap {
    regions: Lock<BTreeMap<usize, (usize, usize)>>,
}

impl RegionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `range` is resident on `node`.
    pub fn register(&self, range: Range<usize>, node: usize) {
        if range.is_empty() {
            return;
        }
        self.regions.lock().insert(range.start, (range.end, node));
    }

    pub fn register_slice<T>(&self, data: &[T], node: usize) {
        let start = data.as_ptr() as usize;
        self.register(start..start + std::mem::size_of_val(data), node);
    }

    pub fn unregister(&self, start: usize) {
        self.regions.lock().remove(&start);
    }

    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MemoryLocator for RegionMap {
    fn accumulate(&self, range: Range<usize>, _part_of: usize, dist: &mut NodeDistribution) {
        let regions = self.regions.lock();
        // The last region starting before `range` may still overlap it.
        let first = regions
            .range(..range.start)
            .next_back()
            .map(|(&start, _)| start)
            .unwrap_or(range.start);
        for (&start, &(end, node)) in regions.range(first..range.end) {
            let lo = start.max(range.start);
            let hi = end.min(range.end);
            if lo < hi && node < dist.num_nodes() {
                dist.add(node, (hi - lo) as u64);
            }
        }
    }
}

/// Bytes per node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDistribution {
    bytes: Vec<u64>,
}

/// Summary statistics of a [`NodeDistribution`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistStat {
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub sd: f64,
}

impl NodeDistribution {
    pub fn new(num_nodes: usize) -> Self {
        NodeDistribution {
            bytes: vec![0; num_nodes],
        }
    }

    /// Distribution of the footprints with the given access mode, or `None`
    /// when there are none.
    pub fn of_footprints(
        footprints: &[Footprint],
        access: Access,
        locator: &dyn MemoryLocator,
        num_nodes: usize,
    ) -> Option<Self> {
        let mut selected = footprints.iter().filter(|fp| fp.access == access).peekable();
        selected.peek()?;
        let mut dist = NodeDistribution::new(num_nodes);
        for fp in selected {
            locator.accumulate(fp.range(), fp.part_of, &mut dist);
        }
        Some(dist)
    }

    pub fn num_nodes(&self) -> usize {
        self.bytes.len()
    }

    pub fn add(&mut self, node: usize, bytes: u64) {
        self.bytes[node] = self.bytes[node].saturating_add(bytes);
    }

    pub fn get(&self, node: usize) -> u64 {
        self.bytes[node]
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.bytes
    }

    /// Population statistics over all nodes.
    ///
    /// The standard deviation accumulates the squared difference of every
    /// node, so it is zero only for a perfectly even spread.
    pub fn stat(&self) -> DistStat {
        let n = self.bytes.len().max(1) as f64;
        let sum = self.bytes.iter().fold(0u64, |acc, &b| acc.saturating_add(b));
        let min = self.bytes.iter().copied().min().unwrap_or(0);
        let max = self.bytes.iter().copied().max().unwrap_or(0);
        let mean = sum as f64 / n;
        let sum_dsq: f64 = self
            .bytes
            .iter()
            .map(|&b| {
                let diff = b as f64 - mean;
                diff * diff
            })
            .sum();
        DistStat {
            sum,
            min,
            max,
            mean,
            sd: (sum_dsq / n).sqrt(),
        }
    }

    /// Whether the data is large and skewed enough to route by node.
    pub fn is_significant(&self, low_limit: u64) -> bool {
        let stat = self.stat();
        stat.sum >= low_limit && stat.sd != 0.0
    }

    /// Expected cost of running on `node`: every byte weighted by the
    /// distance from `node` to where it lives.
    pub fn comm_cost(&self, arch: &Arch, node: usize) -> u64 {
        self.bytes
            .iter()
            .enumerate()
            .map(|(other, &b)| b.saturating_mul(u64::from(arch.comm_cost(node, other))))
            .fold(0, u64::saturating_add)
    }
}
