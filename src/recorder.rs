//! Worker state recorder with Chrome Tracing export.
//!
//! Each worker records the spans it spends in each [`State`] into its own
//! buffer, so recording never contends. Buffers are gathered at shutdown and
//! can be written as JSON for chrome://tracing or ui.perfetto.dev.

use crate::task::TaskId;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const TRACE_FILE: &str = "mir-recorder-trace.json";

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// In the idle loop, looking for work.
    Idle,
    /// Running a task body.
    Task,
    /// Inside a wait, helping.
    Wait,
    /// Sleeping because no work was found.
    Backoff,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Task => "task",
            State::Wait => "wait",
            State::Backoff => "backoff",
        }
    }
}

/// A closed span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub state: State,
    pub worker: usize,
    pub start_us: u64,
    pub duration_us: u64,
    pub task: Option<TaskId>,
}

/// Per-worker span recorder. Spans nest.
#[derive(Debug)]
pub struct Recorder {
    worker: usize,
    open: Vec<(State, Instant, Option<TaskId>)>,
    events: Vec<TraceEvent>,
}

impl Recorder {
    pub fn new(worker: usize) -> Self {
        Recorder {
            worker,
            open: Vec::new(),
            events: Vec::with_capacity(10_000),
        }
    }

    pub fn begin(&mut self, state: State, task: Option<TaskId>) {
        self.open.push((state, Instant::now(), task));
    }

    /// Closes the innermost open span.
    pub fn end(&mut self) {
        if let Some((state, start, task)) = self.open.pop() {
            let start_us =
                start.saturating_duration_since(*GLOBAL_START).as_micros() as u64 + *EPOCH_START_US;
            self.events.push(TraceEvent {
                state,
                worker: self.worker,
                start_us,
                duration_us: start.elapsed().as_micros() as u64,
                task,
            });
        }
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Closes any span still open and returns the recorded events.
    pub fn finish(mut self) -> Vec<TraceEvent> {
        while !self.open.is_empty() {
            self.end();
        }
        self.events
    }
}

/// Writes `events` as a Chrome Tracing JSON array of complete events.
pub fn export_chrome_trace<W: Write>(w: &mut W, events: &[TraceEvent]) -> io::Result<()> {
    writeln!(w, "[")?;
    for (i, event) in events.iter().enumerate() {
        if i > 0 {
            writeln!(w, ",")?;
        }
        write!(
            w,
            "{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}",
            event.state.name(),
            event.start_us,
            event.duration_us,
            event.worker
        )?;
        if let Some(task) = event.task {
            write!(w, ",\"args\":{{\"task\":{task}}}")?;
        }
        write!(w, "}}")?;
    }
    writeln!(w, "\n]")
}

pub fn export_to_file(path: impl AsRef<Path>, events: &[TraceEvent]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    export_chrome_trace(&mut writer, events)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_nest() {
        let mut recorder = Recorder::new(3);
        recorder.begin(State::Idle, None);
        recorder.begin(State::Task, Some(TaskId(9)));
        recorder.begin(State::Wait, None);
        assert_eq!(recorder.depth(), 3);
        recorder.end();
        recorder.end();
        let events = recorder.finish();

        let states: Vec<State> = events.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![State::Wait, State::Task, State::Idle]);
        assert!(events.iter().all(|e| e.worker == 3));
        assert_eq!(events[1].task, Some(TaskId(9)));
        assert!(events[2].start_us <= events[1].start_us);
    }

    #[test]
    fn test_end_without_begin_is_ignored() {
        let mut recorder = Recorder::new(0);
        recorder.end();
        assert!(recorder.finish().is_empty());
    }

    #[test]
    fn test_chrome_export() {
        let events = vec![
            TraceEvent {
                state: State::Task,
                worker: 1,
                start_us: 100,
                duration_us: 5,
                task: Some(TaskId(2)),
            },
            TraceEvent {
                state: State::Backoff,
                worker: 0,
                start_us: 90,
                duration_us: 1,
                task: None,
            },
        ];
        let mut out = Vec::new();
        export_chrome_trace(&mut out, &events).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("[\n"));
        assert!(text.contains(
            "{\"name\":\"task\",\"ph\":\"X\",\"ts\":100,\"dur\":5,\"pid\":1,\"tid\":1,\"args\":{\"task\":2}}"
        ));
        assert!(text.contains("\"name\":\"backoff\""));
        assert!(text.trim_end().ends_with(']'));
    }
}
