use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tlm_schemas::{TimeField, TimedRecord};

// ---------------------------------------------------------------------------
// Stream items
// ---------------------------------------------------------------------------

/// Which of the two streams a value belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Destination => "destination",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a producer puts on its channel.
///
/// `End` is sent exactly once, after the last record, and nothing follows it.
/// A channel that closes without delivering `End` means the producer failed.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem {
    Record(TimedRecord),
    End,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Outcome of comparing the two current heads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// `|src - dst| < tolerance`. Both heads advance.
    Synced,
    /// Source head is older than the destination head. Only source advances.
    SourceBehind,
    /// Destination head is older than the source head. Only destination
    /// advances, after the corrective writer (if any) ran.
    DestBehind,
}

impl Classification {
    /// The run direction this classification continues, `None` for synced.
    pub fn direction(&self) -> Direction {
        match self {
            Classification::Synced => Direction::None,
            Classification::SourceBehind => Direction::DestLead,
            Classification::DestBehind => Direction::SourceLead,
        }
    }
}

/// Which side was ahead on the previous step. Drives run-length suppression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    None,
    /// Source ahead of destination (destination behind).
    SourceLead,
    /// Destination ahead of source (source behind).
    DestLead,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// What the corrective writer replays when the destination is behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackfillPolicy {
    /// Observational run. No writer calls at all.
    Disabled,
    /// Replay the source head into the destination store.
    ReplaySource,
    /// Replay the destination head into the source store.
    ReplayDestination,
}

impl BackfillPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillPolicy::Disabled => "disabled",
            BackfillPolicy::ReplaySource => "replay_source",
            BackfillPolicy::ReplayDestination => "replay_destination",
        }
    }
}

/// Number of same-direction steps between two reported divergence lines.
pub const DEFAULT_REPORT_EVERY: u32 = 25;

/// Default bound of each producer channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct ReconcileOptions {
    pub time_field: TimeField,
    pub tolerance: Duration,
    pub report_every: u32,
    pub report_synced: bool,
    pub backfill: BackfillPolicy,
    /// Also backfill records met while draining the remainder of one stream.
    pub backfill_on_drain: bool,
    /// Fail with [`crate::ReconcileError::OutOfOrder`] if a stream goes
    /// backwards in time.
    pub validate_order: bool,
    pub channel_capacity: usize,
}

impl ReconcileOptions {
    /// Event-time comparison, 2 minute tolerance, source replayed into the
    /// destination when the destination falls behind.
    pub fn event_time() -> Self {
        Self {
            time_field: TimeField::Event,
            tolerance: Duration::minutes(2),
            report_every: DEFAULT_REPORT_EVERY,
            report_synced: false,
            backfill: BackfillPolicy::ReplaySource,
            backfill_on_drain: true,
            validate_order: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Insertion-time comparison, 1 minute tolerance, observational only.
    pub fn insertion_time() -> Self {
        Self {
            time_field: TimeField::Inserted,
            tolerance: Duration::minutes(1),
            backfill: BackfillPolicy::Disabled,
            ..Self::event_time()
        }
    }
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self::event_time()
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// How the merge ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndState {
    /// Both streams reached `End` on the same step.
    Both,
    /// Source ended first; the destination remainder was drained.
    SourceExhausted,
    /// Destination ended first; the source remainder was drained.
    DestinationExhausted,
}

impl EndState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndState::Both => "both_ended",
            EndState::SourceExhausted => "source_exhausted",
            EndState::DestinationExhausted => "destination_exhausted",
        }
    }
}

/// Counters for one completed reconciliation.
///
/// Every record of both streams is accounted for exactly once:
/// `2 * synced + source_behind + dest_behind + drained == source_records + destination_records`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub end: EndState,
    pub steps: u64,
    pub source_records: u64,
    pub destination_records: u64,
    pub synced: u64,
    pub source_behind: u64,
    pub dest_behind: u64,
    pub drained: u64,
    pub backfilled: u64,
    pub suppressed: u64,
    pub last_source: Option<DateTime<Utc>>,
    pub last_destination: Option<DateTime<Utc>>,
}

impl ReconcileSummary {
    pub(crate) fn new() -> Self {
        Self {
            end: EndState::Both,
            steps: 0,
            source_records: 0,
            destination_records: 0,
            synced: 0,
            source_behind: 0,
            dest_behind: 0,
            drained: 0,
            backfilled: 0,
            suppressed: 0,
            last_source: None,
            last_destination: None,
        }
    }

    /// True when no step diverged and nothing had to be drained.
    pub fn is_clean(&self) -> bool {
        self.source_behind == 0 && self.dest_behind == 0 && self.drained == 0
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "end={} steps={} source={} destination={} synced={} source_behind={} dest_behind={} drained={} backfilled={} suppressed={}",
            self.end.as_str(),
            self.steps,
            self.source_records,
            self.destination_records,
            self.synced,
            self.source_behind,
            self.dest_behind,
            self.drained,
            self.backfilled,
            self.suppressed,
        )
    }
}
