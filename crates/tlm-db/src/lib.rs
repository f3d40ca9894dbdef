//! tlm-db
//!
//! Postgres glue for both run modes:
//! - connecting from a resolved [`StoreTarget`],
//! - creating the store table plus its `inserted_on` / `id` bootstrap,
//! - insert-or-update of mapped rows ([`insert_or_update`]),
//! - streaming a table in time order for reconciliation ([`PgOrderedSource`]),
//! - replaying records into a store ([`PgBackfillWriter`]).
//!
//! Table and column names are spliced into SQL text, so every one of them is
//! checked with [`is_sql_identifier`] first. Values are always bound.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::{info, warn};

use tlm_config::secrets::StoreTarget;
use tlm_mapping::FieldType;
use tlm_schemas::is_sql_identifier;

mod source;
mod upsert;

pub use source::{PgOrderedSource, SourceQuery};
pub use upsert::{insert_or_update, PgBackfillWriter, UpsertOutcome};

/// Event-time column of every store table.
pub const TIME_COLUMN: &str = "time";
/// Stamped by trigger on insert.
pub const INSERTED_COLUMN: &str = "inserted_on";
/// Serial row id added at bootstrap.
pub const ID_COLUMN: &str = "id";

/// Env var naming the database used by DB-backed tests.
pub const ENV_TEST_DB_URL: &str = "TLM_TEST_DATABASE_URL";

pub(crate) fn check_identifier(kind: &str, name: &str) -> Result<()> {
    if !is_sql_identifier(name) {
        bail!("{kind} '{name}' is not a valid SQL identifier");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

pub async fn connect(target: &StoreTarget) -> Result<PgPool> {
    let mut opts = PgConnectOptions::from_str(&target.url)
        .with_context(|| format!("invalid store url {}", target.url))?
        .username(&target.user);
    if let Some(pw) = &target.password {
        opts = opts.password(pw);
    }

    let pool = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to connect to {}", target.url))?;

    Ok(pool)
}

/// Connectivity check.
pub async fn ping(pool: &PgPool) -> Result<()> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("ping query failed")?;
    if one != 1 {
        bail!("ping returned {one}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Table bootstrap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStatus {
    Created,
    Existed,
}

fn sql_type(t: FieldType) -> &'static str {
    match t {
        FieldType::Time => "timestamptz",
        FieldType::Int64 => "bigint",
        FieldType::Float64 => "double precision",
        FieldType::String => "text",
    }
}

/// Statements run once after a table is created. `{t}` is the table name.
const BOOTSTRAP_BATCHES: &[&str] = &[
    "alter table {t} add column if not exists inserted_on timestamptz null",
    "create or replace function {t}_stamp_inserted_on() returns trigger language plpgsql as $fn$ \
     begin new.inserted_on = current_timestamp; return new; end; $fn$",
    "drop trigger if exists {t}_inserted_on on {t}",
    "create trigger {t}_inserted_on before insert on {t} for each row execute function {t}_stamp_inserted_on()",
    "create index if not exists {t}_inserted_on_idx on {t} using btree (inserted_on)",
    "create index if not exists {t}_inserted_on_idx_desc on {t} using btree (inserted_on desc)",
    "alter table {t} add column if not exists id serial4 not null",
];

pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = current_schema() and table_name = $1
        )
        "#,
    )
    // Unquoted identifiers fold to lower case.
    .bind(table.to_ascii_lowercase())
    .fetch_one(pool)
    .await
    .context("table_exists query failed")?;
    Ok(exists)
}

/// Create `table` with `columns` unless it exists. A new table also gets the
/// `inserted_on` trigger, its indexes and a serial `id`, all in one
/// transaction.
pub async fn create_table_if_not_exists(
    pool: &PgPool,
    table: &str,
    columns: &[(String, FieldType)],
) -> Result<CreateStatus> {
    check_identifier("table", table)?;
    if columns.is_empty() {
        bail!("cannot create table {table} without columns");
    }
    if table_exists(pool, table).await? {
        return Ok(CreateStatus::Existed);
    }

    let mut defs = Vec::with_capacity(columns.len());
    for (name, ty) in columns {
        check_identifier("column", name)?;
        defs.push(format!("{name} {}", sql_type(*ty)));
    }

    let mut tx = pool.begin().await.context("begin create table")?;
    sqlx::query(&format!("create table {table} ({})", defs.join(", ")))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("create table {table} failed"))?;
    for (i, batch) in BOOTSTRAP_BATCHES.iter().enumerate() {
        let sql = batch.replace("{t}", table);
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("bootstrap batch({i:03}) on {table} failed"))?;
    }
    tx.commit().await.context("commit create table")?;

    info!(table, columns = columns.len(), "store table created");
    Ok(CreateStatus::Created)
}

/// Bring the ingest store online: optionally create the table, then ping.
/// Each failed attempt waits `delay` and retries, up to `tries` attempts.
pub async fn init_store(
    pool: &PgPool,
    table: &str,
    columns: &[(String, FieldType)],
    create: bool,
    tries: u32,
    delay: Duration,
) -> Result<Option<CreateStatus>> {
    let tries = tries.max(1);
    let mut last_err = None;
    for attempt in 1..=tries {
        let status = if create {
            match create_table_if_not_exists(pool, table, columns).await {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(attempt, tries, error = %format!("{e:#}"), "store creation failed, retrying");
                    last_err = Some(e);
                    if attempt < tries {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
            }
        } else {
            None
        };

        match ping(pool).await {
            Ok(()) => {
                info!(table, attempt, "store online");
                return Ok(status);
            }
            Err(e) => {
                warn!(attempt, tries, error = %format!("{e:#}"), "store ping failed, retrying");
                last_err = Some(e);
                if attempt < tries {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    match last_err {
        Some(e) => Err(e.context(format!("store {table} not ready after {tries} attempts"))),
        None => bail!("store {table} not ready after {tries} attempts"),
    }
}
