use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tracing::debug;

use tlm_reconcile::CorrectiveWriter;
use tlm_schemas::{FieldValue, Payload, TimedRecord};

use crate::{check_identifier, TIME_COLUMN};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

fn bind_value<'q>(q: PgQuery<'q>, v: &FieldValue) -> PgQuery<'q> {
    match v {
        FieldValue::Time(t) => q.bind(*t),
        FieldValue::Int(i) => q.bind(*i),
        FieldValue::Float(f) => q.bind(*f),
        FieldValue::Text(s) => q.bind(s.clone()),
    }
}

fn placeholders(cols: &[&str], first: usize, sep: &str) -> String {
    cols.iter()
        .enumerate()
        .map(|(i, c)| format!("{c} = ${}", first + i))
        .collect::<Vec<_>>()
        .join(sep)
}

fn update_sql(table: &str, set_cols: &[&str], key_cols: &[&str]) -> String {
    format!(
        "update {table} set {} where {}",
        placeholders(set_cols, 1, ", "),
        placeholders(key_cols, set_cols.len() + 1, " and ")
    )
}

fn exists_sql(table: &str, key_cols: &[&str]) -> String {
    format!(
        "select 1 from {table} where {} limit 1",
        placeholders(key_cols, 1, " and ")
    )
}

fn insert_sql(table: &str, cols: &[&str]) -> String {
    let params: Vec<String> = (1..=cols.len()).map(|i| format!("${i}")).collect();
    format!(
        "insert into {table} ({}) values ({})",
        cols.join(", "),
        params.join(", ")
    )
}

/// Update the row matching `key_fields`, or insert `row` if none matches.
///
/// Runs in one transaction. Every key field must be present in `row`.
pub async fn insert_or_update(
    pool: &PgPool,
    table: &str,
    key_fields: &[String],
    row: &Payload,
) -> Result<UpsertOutcome> {
    check_identifier("table", table)?;
    if row.is_empty() {
        bail!("refusing to store an empty row into {table}");
    }
    if key_fields.is_empty() {
        bail!("no key fields configured for {table}");
    }
    for col in row.keys() {
        check_identifier("column", col)?;
    }

    let mut key_cols = Vec::with_capacity(key_fields.len());
    let mut key_vals = Vec::with_capacity(key_fields.len());
    for k in key_fields {
        let v = row
            .get(k)
            .with_context(|| format!("key field {k} missing from row for {table}"))?;
        key_cols.push(k.as_str());
        key_vals.push(v);
    }
    let (set_cols, set_vals): (Vec<&str>, Vec<&FieldValue>) = row
        .iter()
        .filter(|(c, _)| !key_fields.contains(*c))
        .map(|(c, v)| (c.as_str(), v))
        .unzip();

    let mut tx = pool.begin().await.context("begin insert_or_update")?;

    let matched = if set_cols.is_empty() {
        let sql = exists_sql(table, &key_cols);
        let mut q = sqlx::query(&sql);
        for v in &key_vals {
            q = bind_value(q, v);
        }
        q.fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("lookup in {table} failed"))?
            .is_some()
    } else {
        let sql = update_sql(table, &set_cols, &key_cols);
        let mut q = sqlx::query(&sql);
        for v in set_vals.iter().chain(key_vals.iter()) {
            q = bind_value(q, v);
        }
        q.execute(&mut *tx)
            .await
            .with_context(|| format!("update {table} failed"))?
            .rows_affected()
            > 0
    };

    let outcome = if matched {
        UpsertOutcome::Updated
    } else {
        let cols: Vec<&str> = row.keys().map(String::as_str).collect();
        let sql = insert_sql(table, &cols);
        let mut q = sqlx::query(&sql);
        for v in row.values() {
            q = bind_value(q, v);
        }
        q.execute(&mut *tx)
            .await
            .with_context(|| format!("insert into {table} failed"))?;
        UpsertOutcome::Inserted
    };

    tx.commit().await.context("commit insert_or_update")?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Corrective writer
// ---------------------------------------------------------------------------

/// Replays records into `table` by insert-or-update on the event time.
///
/// Ids and `inserted_on` are not copied; the target store assigns its own.
pub struct PgBackfillWriter {
    pool: PgPool,
    table: String,
    key_fields: Vec<String>,
    written: u64,
}

impl PgBackfillWriter {
    pub fn new(pool: PgPool, table: &str, key_fields: Vec<String>) -> Result<Self> {
        check_identifier("table", table)?;
        for k in &key_fields {
            check_identifier("key field", k)?;
        }
        Ok(Self {
            pool,
            table: table.to_string(),
            key_fields,
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl CorrectiveWriter for PgBackfillWriter {
    async fn backfill(&mut self, record: &TimedRecord) -> Result<()> {
        let row = record.to_row(TIME_COLUMN);
        let outcome = insert_or_update(&self.pool, &self.table, &self.key_fields, &row)
            .await
            .with_context(|| format!("backfill {record} into {}", self.table))?;
        self.written += 1;
        debug!(table = %self.table, %record, ?outcome, "backfilled");
        Ok(())
    }
}
