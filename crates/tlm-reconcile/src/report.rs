//! Operator-facing divergence report.
//!
//! Lines are one per reported step:
//!
//! ```text
//! 0000003: A S: 2024-01-01T00:05:00 -> +5m0s -> T: 2024-01-01T00:00:00
//! ```
//!
//! Tags: `=` synced, `B` source behind, `A` destination behind, `D` a
//! destination record drained after the source ended, `S` a source record
//! drained after the destination ended.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use tlm_schemas::TIME_LAYOUT;

use crate::{Classification, Direction, ReconcileSummary, Side};

// ---------------------------------------------------------------------------
// Lines
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Synced,
    SourceBehind,
    DestBehind,
    /// Destination record with no source left to compare against.
    DestOnly,
    /// Source record with no destination left to compare against.
    SourceOnly,
}

impl Tag {
    pub fn symbol(&self) -> char {
        match self {
            Tag::Synced => '=',
            Tag::SourceBehind => 'B',
            Tag::DestBehind => 'A',
            Tag::DestOnly => 'D',
            Tag::SourceOnly => 'S',
        }
    }
}

impl From<Classification> for Tag {
    fn from(c: Classification) -> Self {
        match c {
            Classification::Synced => Tag::Synced,
            Classification::SourceBehind => Tag::SourceBehind,
            Classification::DestBehind => Tag::DestBehind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepLine {
    pub step: u64,
    pub tag: Tag,
    pub source: Option<DateTime<Utc>>,
    pub destination: Option<DateTime<Utc>>,
    /// `source - destination`, absent on drain lines.
    pub delta: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportLine {
    Step(StepLine),
    /// `exhausted` reached its end; the other side's remainder follows.
    DrainStarted { exhausted: Side },
    Finished(ReconcileSummary),
}

impl ReportLine {
    pub fn as_step(&self) -> Option<&StepLine> {
        match self {
            ReportLine::Step(s) => Some(s),
            _ => None,
        }
    }
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    match t {
        Some(t) => t.format(TIME_LAYOUT).to_string(),
        None => "-".to_string(),
    }
}

/// Signed compact duration: `+5m0s`, `-1h2m3s`, `0s`, `+1.500s`.
pub fn format_delta(delta: Duration) -> String {
    let ms = delta.num_milliseconds();
    let sign = match ms.signum() {
        1 => "+",
        -1 => "-",
        _ => "",
    };
    let ms = ms.unsigned_abs();
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let secs = (ms / 1_000) % 60;
    let frac = ms % 1_000;

    let seconds = if frac == 0 {
        format!("{secs}s")
    } else {
        format!("{secs}.{frac:03}s")
    };
    if hours > 0 {
        format!("{sign}{hours}h{minutes}m{seconds}")
    } else if minutes > 0 {
        format!("{sign}{minutes}m{seconds}")
    } else {
        format!("{sign}{seconds}")
    }
}

impl fmt::Display for StepLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let delta = match self.delta {
            Some(d) => format_delta(d),
            None => "-".to_string(),
        };
        write!(
            f,
            "{:07}: {} S: {} -> {:>9} -> T: {}",
            self.step,
            self.tag.symbol(),
            fmt_time(self.source),
            delta,
            fmt_time(self.destination),
        )
    }
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportLine::Step(s) => write!(f, "{s}"),
            ReportLine::DrainStarted { exhausted } => match exhausted {
                Side::Source => write!(f, "source rest"),
                Side::Destination => write!(f, "destination rest"),
            },
            ReportLine::Finished(summary) => write!(f, "finished {summary}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Where report lines go. Called on the engine task, in step order.
pub trait ReportSink: Send {
    fn emit(&mut self, line: &ReportLine);
}

/// Plain lines on stdout. `println!` flushes per line.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn emit(&mut self, line: &ReportLine) {
        println!("{line}");
    }
}

impl ReportSink for Vec<ReportLine> {
    fn emit(&mut self, line: &ReportLine) {
        self.push(line.clone());
    }
}

// ---------------------------------------------------------------------------
// Run-length gate
// ---------------------------------------------------------------------------

/// Decides which divergence steps are printed.
///
/// The first step of a new direction is always printed. After that one line
/// is printed every `every` steps of the same direction, so a run reports
/// steps 1, 1+every, 1+2*every, ... A synced step ends the run.
#[derive(Clone, Debug)]
pub struct RunLengthGate {
    every: u32,
    budget: u32,
    direction: Direction,
}

impl RunLengthGate {
    pub fn new(every: u32) -> Self {
        Self {
            every,
            budget: every,
            direction: Direction::None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn admit(&mut self, direction: Direction) -> bool {
        if direction == Direction::None {
            self.reset();
            return false;
        }
        if direction != self.direction {
            self.direction = direction;
            self.budget = self.every;
            return true;
        }
        self.budget = self.budget.saturating_sub(1);
        if self.budget == 0 {
            self.budget = self.every;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.direction = Direction::None;
        self.budget = self.every;
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Formats comparator decisions into report lines and applies suppression.
pub struct DivergenceReporter<'s> {
    sink: &'s mut dyn ReportSink,
    gate: RunLengthGate,
    report_synced: bool,
    suppressed: u64,
}

impl<'s> DivergenceReporter<'s> {
    pub fn new(sink: &'s mut dyn ReportSink, report_every: u32, report_synced: bool) -> Self {
        Self {
            sink,
            gate: RunLengthGate::new(report_every),
            report_synced,
            suppressed: 0,
        }
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    pub fn direction(&self) -> Direction {
        self.gate.direction()
    }

    pub fn classified(
        &mut self,
        step: u64,
        class: Classification,
        source: DateTime<Utc>,
        destination: DateTime<Utc>,
    ) {
        let line = StepLine {
            step,
            tag: class.into(),
            source: Some(source),
            destination: Some(destination),
            delta: Some(source - destination),
        };
        match class {
            Classification::Synced => {
                self.gate.reset();
                if self.report_synced {
                    self.sink.emit(&ReportLine::Step(line));
                }
            }
            Classification::SourceBehind | Classification::DestBehind => {
                if self.gate.admit(class.direction()) {
                    self.sink.emit(&ReportLine::Step(line));
                } else {
                    self.suppressed += 1;
                }
            }
        }
    }

    pub fn drain_started(&mut self, exhausted: Side) {
        self.gate.reset();
        self.sink.emit(&ReportLine::DrainStarted { exhausted });
    }

    /// One drained record of `remaining`. Never suppressed.
    pub fn drained(&mut self, step: u64, remaining: Side, time: DateTime<Utc>) {
        let (tag, source, destination) = match remaining {
            Side::Source => (Tag::SourceOnly, Some(time), None),
            Side::Destination => (Tag::DestOnly, None, Some(time)),
        };
        self.sink.emit(&ReportLine::Step(StepLine {
            step,
            tag,
            source,
            destination,
            delta: None,
        }));
    }

    pub fn finished(&mut self, summary: &ReconcileSummary) {
        self.sink.emit(&ReportLine::Finished(summary.clone()));
    }
}
