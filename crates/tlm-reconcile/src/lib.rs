//! tlm-reconcile
//!
//! Streaming reconciliation of two time-ordered record streams.
//!
//! Two producer tasks push records from their stores onto bounded channels,
//! each followed by exactly one `End`. A single comparator task walks both
//! heads in lock-step, classifies every step as synced, source-behind or
//! destination-behind, drains whichever stream outlives the other, and hands
//! every decision to a reporter. An optional corrective writer re-inserts
//! records that one side is missing.
//!
//! Invariants:
//! - Each record of each stream is visited exactly once.
//! - Nothing is read from a channel after its `End`.
//! - A channel closed without `End` is a failure, never an ending.
//! - Writes run on the comparator task, one at a time, and always finish
//!   before the next step or a cancellation takes effect.

mod engine;
mod error;
pub mod report;
mod source;
mod types;

pub use engine::{classify, Reconciler};
pub use error::ReconcileError;
pub use report::{
    format_delta, DivergenceReporter, ReportLine, ReportSink, RunLengthGate, StdoutSink,
    StepLine, Tag,
};
pub use source::{spawn_producer, CorrectiveWriter, RecordSource};
pub use types::*;
