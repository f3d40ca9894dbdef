//! tlm-testkit
//!
//! In-memory stand-ins for every seam of the two run modes, so scenarios run
//! without Postgres or a broker:
//! - record sources: [`VecSource`], [`FailingSource`], [`PanickingSource`],
//!   [`StallingSource`]
//! - corrective writer: [`RecordingWriter`]
//! - message bus and store: [`ScriptedBus`], [`MemoryStore`]
//! - fixtures: [`at`], [`records_at`], [`load_records_csv`]

use std::collections::VecDeque;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;

use tlm_ingest::{BusMessage, MessageBus, RecordStore};
use tlm_reconcile::{CorrectiveWriter, RecordSource, ReportLine, StepLine};
use tlm_schemas::{FieldValue, Payload, TimedRecord};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// `2024-01-01T00:00:00Z` plus `minutes`.
pub fn at(minutes: i64) -> DateTime<Utc> {
    let base = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default();
    base + Duration::minutes(minutes)
}

/// One record per entry of `minutes`, ids counting up from `first_id`.
/// Each carries a `total` reading so backfilled rows are recognizable.
pub fn records_at(first_id: i64, minutes: &[i64]) -> Vec<TimedRecord> {
    minutes
        .iter()
        .enumerate()
        .map(|(i, m)| {
            TimedRecord::new(first_id + i as i64, at(*m))
                .with_field("total", FieldValue::Float(*m as f64))
        })
        .collect()
}

/// Load records from a CSV file with header `id,time,inserted_on`.
/// Times are RFC 3339; `inserted_on` may be empty.
pub fn load_records_csv(path: &str) -> Result<Vec<TimedRecord>> {
    let mut rdr =
        csv::Reader::from_path(path).with_context(|| format!("open records csv: {path}"))?;
    let mut out = Vec::new();

    for (line, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("{path}: row {}", line + 1))?;
        if rec.len() != 3 {
            bail!("{path}: row {} has {} columns, want 3", line + 1, rec.len());
        }
        let id: i64 = rec[0].trim().parse().context("parse id")?;
        let time: DateTime<Utc> = rec[1].trim().parse().context("parse time")?;
        let mut record = TimedRecord::new(id, time);
        let inserted = rec[2].trim();
        if !inserted.is_empty() {
            record = record.with_inserted_at(inserted.parse().context("parse inserted_on")?);
        }
        out.push(record);
    }
    Ok(out)
}

/// Step lines of a captured report, in order.
pub fn step_lines(lines: &[ReportLine]) -> Vec<&StepLine> {
    lines.iter().filter_map(ReportLine::as_step).collect()
}

// ---------------------------------------------------------------------------
// Record sources
// ---------------------------------------------------------------------------

pub struct VecSource {
    label: String,
    records: Vec<TimedRecord>,
}

impl VecSource {
    pub fn new(label: &str, records: Vec<TimedRecord>) -> Self {
        Self {
            label: label.to_string(),
            records,
        }
    }

    pub fn boxed(label: &str, records: Vec<TimedRecord>) -> Box<dyn RecordSource> {
        Box::new(Self::new(label, records))
    }
}

impl RecordSource for VecSource {
    fn describe(&self) -> String {
        format!("vec:{}", self.label)
    }

    fn records(&self) -> BoxStream<'_, Result<TimedRecord>> {
        stream::iter(self.records.iter().cloned().map(Ok)).boxed()
    }
}

/// Yields `good`, then fails with `cause`.
pub struct FailingSource {
    good: Vec<TimedRecord>,
    cause: String,
}

impl FailingSource {
    pub fn boxed(good: Vec<TimedRecord>, cause: &str) -> Box<dyn RecordSource> {
        Box::new(Self {
            good,
            cause: cause.to_string(),
        })
    }
}

impl RecordSource for FailingSource {
    fn describe(&self) -> String {
        "failing".to_string()
    }

    fn records(&self) -> BoxStream<'_, Result<TimedRecord>> {
        let cause = self.cause.clone();
        stream::iter(self.good.iter().cloned().map(Ok))
            .chain(stream::once(async move { Err(anyhow::anyhow!(cause)) }))
            .boxed()
    }
}

/// Yields `good`, then panics with `message`. A stand-in for a driver bug
/// that kills the producer task without an error or an end marker.
pub struct PanickingSource {
    good: Vec<TimedRecord>,
    message: String,
}

impl PanickingSource {
    pub fn boxed(good: Vec<TimedRecord>, message: &str) -> Box<dyn RecordSource> {
        Box::new(Self {
            good,
            message: message.to_string(),
        })
    }
}

fn explode(message: &str) -> Result<TimedRecord> {
    panic!("{message}")
}

impl RecordSource for PanickingSource {
    fn describe(&self) -> String {
        "panicking".to_string()
    }

    fn records(&self) -> BoxStream<'_, Result<TimedRecord>> {
        let message = self.message.clone();
        stream::iter(self.good.iter().cloned().map(Ok))
            .chain(stream::once(async move { explode(&message) }))
            .boxed()
    }
}

/// Yields `records`, then never ends. A stand-in for a hung query.
pub struct StallingSource {
    records: Vec<TimedRecord>,
}

impl StallingSource {
    pub fn boxed(records: Vec<TimedRecord>) -> Box<dyn RecordSource> {
        Box::new(Self { records })
    }
}

impl RecordSource for StallingSource {
    fn describe(&self) -> String {
        "stalling".to_string()
    }

    fn records(&self) -> BoxStream<'_, Result<TimedRecord>> {
        stream::iter(self.records.iter().cloned().map(Ok))
            .chain(stream::pending())
            .boxed()
    }
}

// ---------------------------------------------------------------------------
// Corrective writer
// ---------------------------------------------------------------------------

/// Keeps every backfilled record. Optionally fails on one sequence id.
#[derive(Debug, Default)]
pub struct RecordingWriter {
    pub written: Vec<TimedRecord>,
    pub fail_on: Option<i64>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(sequence_id: i64) -> Self {
        Self {
            written: Vec::new(),
            fail_on: Some(sequence_id),
        }
    }

    pub fn written_times(&self) -> Vec<DateTime<Utc>> {
        self.written.iter().map(|r| r.timestamp).collect()
    }
}

#[async_trait]
impl CorrectiveWriter for RecordingWriter {
    async fn backfill(&mut self, record: &TimedRecord) -> Result<()> {
        if self.fail_on == Some(record.sequence_id) {
            bail!("duplicate key value violates unique constraint");
        }
        self.written.push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bus and store
// ---------------------------------------------------------------------------

/// Replays queued payloads. Once empty it either reports the bus closed or,
/// with `hold_open`, waits forever like an idle broker.
#[derive(Debug, Default)]
pub struct ScriptedBus {
    queue: VecDeque<BusMessage>,
    hold_open: bool,
    pub disconnected: bool,
}

impl ScriptedBus {
    pub fn new(payloads: &[&str]) -> Self {
        Self {
            queue: payloads
                .iter()
                .map(|p| BusMessage {
                    topic: "tele/meter/SENSOR".to_string(),
                    payload: p.as_bytes().to_vec(),
                })
                .collect(),
            hold_open: false,
            disconnected: false,
        }
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[async_trait]
impl MessageBus for ScriptedBus {
    async fn next_message(&mut self) -> Result<Option<BusMessage>> {
        if self.disconnected {
            return Ok(None);
        }
        match self.queue.pop_front() {
            Some(m) => Ok(Some(m)),
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.disconnected = true;
        Ok(())
    }
}

/// Collects rows. Optionally fails once it holds `capacity` rows.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub rows: Vec<Payload>,
    pub capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            rows: Vec::new(),
            capacity: Some(capacity),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn store(&mut self, row: &Payload) -> Result<()> {
        if self.capacity.is_some_and(|cap| self.rows.len() >= cap) {
            bail!("could not extend relation: disk full");
        }
        self.rows.push(row.clone());
        Ok(())
    }
}
