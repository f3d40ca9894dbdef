//! tlm-schemas
//!
//! Record shapes shared by the ingestion path and the reconciliation engine.
//! Plain data only: no IO, no database types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One typed column value.
///
/// The set of variants is closed. Every conversion into a `FieldValue`
/// happens through an explicit, declared field type; nothing here inspects
/// types at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Time(DateTime<Utc>),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Time(_) => "time",
            FieldValue::Int(_) => "int64",
            FieldValue::Float(_) => "float64",
            FieldValue::Text(_) => "string",
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Time(t) => write!(f, "{}", t.format(TIME_LAYOUT)),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Column name -> value. `BTreeMap` keeps column order deterministic, which
/// keeps generated SQL stable across runs.
pub type Payload = BTreeMap<String, FieldValue>;

/// Timestamp layout used in operator output and for parsing meter payloads.
pub const TIME_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";

/// Longest identifier Postgres keeps without truncation.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// True for a plain, unquoted SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`,
/// at most [`MAX_IDENTIFIER_LEN`] bytes. Table and column names are checked
/// with this before they are ever spliced into SQL text.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Which time column drives a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeField {
    /// Event time (`time` column).
    Event,
    /// Wall-clock persistence time (`inserted_on` column).
    Inserted,
}

impl TimeField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeField::Event => "event",
            TimeField::Inserted => "inserted",
        }
    }
}

/// The unit exchanged by the reconciliation engine.
///
/// Immutable once produced. The engine only ever reads `timestamp` or
/// `inserted_at`; `sequence_id` is for reporting and `payload` is carried
/// through untouched to the corrective writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedRecord {
    pub timestamp: DateTime<Utc>,
    pub inserted_at: Option<DateTime<Utc>>,
    pub sequence_id: i64,
    pub payload: Payload,
}

impl TimedRecord {
    pub fn new(sequence_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            inserted_at: None,
            sequence_id,
            payload: Payload::new(),
        }
    }

    pub fn with_inserted_at(mut self, inserted_at: DateTime<Utc>) -> Self {
        self.inserted_at = Some(inserted_at);
        self
    }

    pub fn with_field(mut self, column: impl Into<String>, value: FieldValue) -> Self {
        self.payload.insert(column.into(), value);
        self
    }

    /// The comparison time for `field`, or `None` when the record does not
    /// carry it (only possible for [`TimeField::Inserted`]).
    pub fn time_of(&self, field: TimeField) -> Option<DateTime<Utc>> {
        match field {
            TimeField::Event => Some(self.timestamp),
            TimeField::Inserted => self.inserted_at,
        }
    }

    /// Payload plus the event time under `time_column`, i.e. the row shape a
    /// writer needs to re-insert this record.
    pub fn to_row(&self, time_column: &str) -> Payload {
        let mut row = self.payload.clone();
        row.insert(time_column.to_string(), FieldValue::Time(self.timestamp));
        row
    }
}

impl fmt::Display for TimedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}", self.sequence_id, self.timestamp.format(TIME_LAYOUT))?;
        if let Some(ins) = self.inserted_at {
            write!(f, "/{}", ins.format(TIME_LAYOUT))?;
        }
        write!(f, "]")
    }
}
