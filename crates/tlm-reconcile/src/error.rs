use std::fmt;

use chrono::{DateTime, Utc};
use tlm_schemas::TimeField;

use crate::Side;

/// Why a reconciliation stopped before both streams reached their end.
///
/// Every variant aborts the run. None of them is retried inside the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileError {
    /// A channel closed without delivering `End`, and the producer task gave
    /// no better explanation.
    ChannelClosed(Side),
    /// The producer for `side` failed while querying its store.
    SourceFailed { side: Side, cause: String },
    /// A record lacks the time field the run compares on.
    MissingTimeField {
        side: Side,
        field: TimeField,
        sequence_id: i64,
    },
    /// A stream went backwards in time (only checked when enabled).
    OutOfOrder {
        side: Side,
        previous: DateTime<Utc>,
        got: DateTime<Utc>,
        sequence_id: i64,
    },
    /// The corrective writer rejected a record.
    BackfillFailed { sequence_id: i64, cause: String },
    /// A backfill policy was requested with no writer wired in, or options
    /// are otherwise unusable.
    Misconfigured(String),
    /// Cancellation was requested. Writes already started have completed.
    Cancelled,
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::ChannelClosed(side) => {
                write!(f, "{side} channel closed before end of stream")
            }
            ReconcileError::SourceFailed { side, cause } => {
                write!(f, "{side} producer failed: {cause}")
            }
            ReconcileError::MissingTimeField {
                side,
                field,
                sequence_id,
            } => write!(
                f,
                "{side} record id={sequence_id} has no {} time",
                field.as_str()
            ),
            ReconcileError::OutOfOrder {
                side,
                previous,
                got,
                sequence_id,
            } => write!(
                f,
                "{side} stream out of order at id={sequence_id}: {got} after {previous}"
            ),
            ReconcileError::BackfillFailed { sequence_id, cause } => {
                write!(f, "backfill of id={sequence_id} failed: {cause}")
            }
            ReconcileError::Misconfigured(msg) => write!(f, "reconcile misconfigured: {msg}"),
            ReconcileError::Cancelled => write!(f, "reconcile cancelled"),
        }
    }
}

impl std::error::Error for ReconcileError {}
