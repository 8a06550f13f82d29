//! Worker and task statistics.
//!
//! Collection is off by default and enabled through `--worker-stats` and
//! `--task-stats`. Each worker accumulates into its own record; records are
//! gathered at shutdown and can be written as CSV.

use crate::task::TaskId;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

pub const WORKER_STATS_FILE: &str = "mir-worker-stats";
pub const TASK_STATS_FILE: &str = "mir-task-stats";

/// Scheduling counters of one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker: usize,
    /// Tasks this worker created and enqueued.
    pub created: u64,
    /// Tasks popped from containers this worker owns.
    pub owned: u64,
    pub stolen: u64,
    /// Tasks run on the spot instead of being enqueued.
    pub inlined: u64,
    /// Executed tasks that carried a communication cost estimate.
    pub comm_tasks: u64,
    pub total_comm_cost: u64,
    pub lowest_comm_cost: Option<u64>,
    pub highest_comm_cost: u64,
    /// Steals of costed tasks by hop distance, index `d - 1`. Empty unless
    /// the policy steals by distance.
    pub stolen_by_distance: Vec<u64>,
}

impl WorkerStats {
    pub fn new(worker: usize, distances: usize) -> Self {
        WorkerStats {
            worker,
            stolen_by_distance: vec![0; distances],
            ..WorkerStats::default()
        }
    }

    pub fn record_comm_cost(&mut self, cost: u64) {
        self.comm_tasks += 1;
        self.total_comm_cost += cost;
        self.highest_comm_cost = self.highest_comm_cost.max(cost);
        self.lowest_comm_cost = Some(self.lowest_comm_cost.map_or(cost, |low| low.min(cost)));
    }

    pub fn record_steal_distance(&mut self, distance: usize) {
        if let Some(slot) = distance
            .checked_sub(1)
            .and_then(|index| self.stolen_by_distance.get_mut(index))
        {
            *slot += 1;
        }
    }

    pub fn avg_comm_cost(&self) -> u64 {
        match self.comm_tasks {
            0 => 0,
            n => self.total_comm_cost / n,
        }
    }

    /// Tasks this worker executed.
    pub fn executed(&self) -> u64 {
        self.owned + self.stolen + self.inlined
    }

    pub const CSV_HEADER: &'static str = "worker,created,owned,stolen,inlined,comm_tasks,total_comm_cost,avg_comm_cost,lowest_comm_cost,highest_comm_cost,comm_tasks_stolen_by_diameter";

    pub fn write_csv_row<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write!(
            w,
            "{},{},{},{},{},{},{},{},{},{},",
            self.worker,
            self.created,
            self.owned,
            self.stolen,
            self.inlined,
            self.comm_tasks,
            self.total_comm_cost,
            self.avg_comm_cost(),
            self.lowest_comm_cost.unwrap_or(0),
            self.highest_comm_cost,
        )?;
        if self.stolen_by_distance.is_empty() {
            writeln!(w, "NA")
        } else {
            write!(w, "[")?;
            for count in &self.stolen_by_distance {
                write!(w, "{count}-")?;
            }
            writeln!(w, "]")
        }
    }
}

/// One executed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: Option<String>,
    pub parent: Option<TaskId>,
    pub worker: usize,
    pub depth: u32,
    /// Time from creation until the body started.
    pub queued: Duration,
    pub exec: Duration,
    /// Scheduling work done by the worker while this task was current:
    /// pops, steals and backoff inside its waits.
    pub overhead: Duration,
    pub children: u32,
    pub comm_cost: Option<u64>,
    pub panicked: bool,
}

impl TaskRecord {
    pub const CSV_HEADER: &'static str =
        "task,name,parent,worker,depth,queued_ns,exec_ns,overhead_ns,children,comm_cost,panicked";

    pub fn write_csv_row<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(
            w,
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.id,
            self.name.as_deref().unwrap_or(""),
            self.parent.map_or(0, |p| p.as_u64()),
            self.worker,
            self.depth,
            self.queued.as_nanos(),
            self.exec.as_nanos(),
            self.overhead.as_nanos(),
            self.children,
            self.comm_cost.map_or_else(|| "NA".to_string(), |c| c.to_string()),
            u8::from(self.panicked),
        )
    }
}

pub fn write_worker_stats<W: Write>(w: &mut W, stats: &[WorkerStats]) -> io::Result<()> {
    writeln!(w, "{}", WorkerStats::CSV_HEADER)?;
    for worker in stats {
        worker.write_csv_row(w)?;
    }
    Ok(())
}

pub fn write_task_stats<W: Write>(w: &mut W, records: &[TaskRecord]) -> io::Result<()> {
    writeln!(w, "{}", TaskRecord::CSV_HEADER)?;
    for record in records {
        record.write_csv_row(w)?;
    }
    Ok(())
}

pub(crate) fn write_to_file<T>(
    path: impl AsRef<Path>,
    items: &[T],
    write: fn(&mut BufWriter<File>, &[T]) -> io::Result<()>,
) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write(&mut writer, items)?;
    writer.flush()
}
