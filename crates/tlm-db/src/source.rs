use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};

use tlm_reconcile::RecordSource;
use tlm_schemas::{FieldValue, Payload, TimeField, TimedRecord};

use crate::{check_identifier, ID_COLUMN, INSERTED_COLUMN, TIME_COLUMN};

/// What a [`PgOrderedSource`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceQuery {
    /// `select * from <table> order by <time column> asc, id asc`. Columns
    /// other than `time`, `inserted_on` and `id` land in the payload.
    Structured { table: String, order_by: TimeField },
    /// Caller SQL. Rows must be `(inserted_on, time, id)` by position and
    /// already ordered; the payload stays empty.
    Raw(String),
}

/// Streams one store table in time order.
pub struct PgOrderedSource {
    pool: PgPool,
    label: String,
    sql: String,
    raw: bool,
}

impl PgOrderedSource {
    pub fn new(pool: PgPool, label: impl Into<String>, query: SourceQuery) -> Result<Self> {
        let (sql, raw) = match query {
            SourceQuery::Structured { table, order_by } => {
                check_identifier("table", &table)?;
                let column = match order_by {
                    TimeField::Event => TIME_COLUMN,
                    TimeField::Inserted => INSERTED_COLUMN,
                };
                (
                    format!("select * from {table} order by {column} asc, {ID_COLUMN} asc"),
                    false,
                )
            }
            SourceQuery::Raw(sql) => {
                if sql.trim().is_empty() {
                    bail!("raw source query is empty");
                }
                (sql, true)
            }
        };
        Ok(Self {
            pool,
            label: label.into(),
            sql,
            raw,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl RecordSource for PgOrderedSource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn records(&self) -> BoxStream<'_, Result<TimedRecord>> {
        let raw = self.raw;
        sqlx::query(&self.sql)
            .fetch(&self.pool)
            .map(move |row| {
                let row = row.context("source query failed")?;
                if raw {
                    decode_positional(&row)
                } else {
                    decode_structured(&row)
                }
            })
            .boxed()
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn get_time(row: &PgRow, idx: usize) -> Result<Option<DateTime<Utc>>> {
    let col = &row.columns()[idx];
    match col.type_info().name() {
        "TIMESTAMPTZ" => Ok(row.try_get::<Option<DateTime<Utc>>, _>(idx)?),
        "TIMESTAMP" => Ok(row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|n| n.and_utc())),
        other => bail!("column {} has type {other}, expected a timestamp", col.name()),
    }
}

fn get_id(row: &PgRow, idx: usize) -> Result<i64> {
    let col = &row.columns()[idx];
    let id = match col.type_info().name() {
        "INT8" => row.try_get::<Option<i64>, _>(idx)?,
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(i64::from),
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(i64::from),
        other => bail!("column {} has type {other}, expected an integer id", col.name()),
    };
    id.ok_or_else(|| anyhow!("column {} is null", col.name()))
}

fn get_value(row: &PgRow, idx: usize) -> Result<Option<FieldValue>> {
    let col = &row.columns()[idx];
    let v = match col.type_info().name() {
        "TIMESTAMPTZ" | "TIMESTAMP" => get_time(row, idx)?.map(FieldValue::Time),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(FieldValue::Int),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| FieldValue::Int(v.into())),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| FieldValue::Int(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(FieldValue::Float),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| FieldValue::Float(v.into())),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(idx)?.map(FieldValue::Text)
        }
        other => bail!("column {} has unsupported type {other}", col.name()),
    };
    Ok(v)
}

fn decode_structured(row: &PgRow) -> Result<TimedRecord> {
    let mut timestamp = None;
    let mut inserted_at = None;
    let mut sequence_id = None;
    let mut payload = Payload::new();

    for (idx, col) in row.columns().iter().enumerate() {
        match col.name() {
            TIME_COLUMN => timestamp = get_time(row, idx)?,
            INSERTED_COLUMN => inserted_at = get_time(row, idx)?,
            ID_COLUMN => sequence_id = Some(get_id(row, idx)?),
            name => {
                // Null columns are left out of the payload.
                if let Some(v) = get_value(row, idx)? {
                    payload.insert(name.to_string(), v);
                }
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| anyhow!("row has no {TIME_COLUMN} value"))?;
    let sequence_id = sequence_id.ok_or_else(|| anyhow!("row has no {ID_COLUMN} column"))?;
    Ok(TimedRecord {
        timestamp,
        inserted_at,
        sequence_id,
        payload,
    })
}

fn decode_positional(row: &PgRow) -> Result<TimedRecord> {
    let shape = || {
        format!(
            "protocol violation: raw query rows must be ({INSERTED_COLUMN}, {TIME_COLUMN}, {ID_COLUMN}), got {} column(s)",
            row.len()
        )
    };
    if row.len() != 3 {
        bail!(shape());
    }
    let inserted_at = get_time(row, 0).with_context(shape)?;
    let timestamp = get_time(row, 1)
        .with_context(shape)?
        .ok_or_else(|| anyhow!("{}: {TIME_COLUMN} is null", shape()))?;
    let sequence_id = get_id(row, 2).with_context(shape)?;
    Ok(TimedRecord {
        timestamp,
        inserted_at,
        sequence_id,
        payload: Payload::new(),
    })
}
