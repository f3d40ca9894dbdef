//! scenario_store_roundtrip
//!
//! GREEN when, against a real Postgres:
//! 1. A fresh table is Created (with `inserted_on` + `id`), a second call sees Existed.
//! 2. insert_or_update inserts once, then updates the row with the same key.
//! 3. The structured source yields rows ordered by `time`, payload decoded by type,
//!    `inserted_on` stamped by the trigger.
//! 4. The raw source maps `(inserted_on, time, id)` by position and rejects any
//!    other shape as a protocol violation.
//!
//! Skips unless TLM_TEST_DATABASE_URL is set. Uses a throwaway table per run.

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use futures_util::TryStreamExt;
use sqlx::postgres::PgPoolOptions;

use tlm_db::{
    create_table_if_not_exists, insert_or_update, CreateStatus, PgOrderedSource, SourceQuery,
    UpsertOutcome, ENV_TEST_DB_URL,
};
use tlm_mapping::FieldType;
use tlm_reconcile::RecordSource;
use tlm_schemas::{FieldValue, Payload, TimeField, TimedRecord};

fn row(time: chrono::DateTime<Utc>, total: f64, power: i64) -> Payload {
    let mut p = Payload::new();
    p.insert("time".to_string(), FieldValue::Time(time));
    p.insert("total".to_string(), FieldValue::Float(total));
    p.insert("power_curr".to_string(), FieldValue::Int(power));
    p
}

#[tokio::test]
async fn store_roundtrip_create_upsert_and_read_ordered() -> Result<()> {
    let url = match std::env::var(ENV_TEST_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: {ENV_TEST_DB_URL} not set");
            return Ok(());
        }
    };
    let pool = PgPoolOptions::new().max_connections(2).connect(&url).await?;
    let table = format!("tlm_test_{}", uuid::Uuid::new_v4().simple());

    let columns = vec![
        ("time".to_string(), FieldType::Time),
        ("total".to_string(), FieldType::Float64),
        ("power_curr".to_string(), FieldType::Int64),
        ("meter".to_string(), FieldType::String),
    ];
    assert_eq!(
        create_table_if_not_exists(&pool, &table, &columns).await?,
        CreateStatus::Created
    );
    assert_eq!(
        create_table_if_not_exists(&pool, &table, &columns).await?,
        CreateStatus::Existed
    );

    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    let t1 = t0 + Duration::minutes(1);
    let keys = vec!["time".to_string()];

    // Out of time order on purpose.
    assert_eq!(
        insert_or_update(&pool, &table, &keys, &row(t1, 11.0, 300)).await?,
        UpsertOutcome::Inserted
    );
    assert_eq!(
        insert_or_update(&pool, &table, &keys, &row(t0, 10.0, 100)).await?,
        UpsertOutcome::Inserted
    );
    assert_eq!(
        insert_or_update(&pool, &table, &keys, &row(t0, 10.5, 120)).await?,
        UpsertOutcome::Updated
    );

    let structured = PgOrderedSource::new(
        pool.clone(),
        "source",
        SourceQuery::Structured {
            table: table.clone(),
            order_by: TimeField::Event,
        },
    )?;
    let got: Vec<TimedRecord> = structured.records().try_collect().await?;
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].timestamp, t0);
    assert_eq!(got[1].timestamp, t1);
    assert_eq!(got[0].payload.get("total"), Some(&FieldValue::Float(10.5)));
    assert_eq!(got[0].payload.get("power_curr"), Some(&FieldValue::Int(120)));
    // meter was never written: null columns stay out of the payload.
    assert!(!got[0].payload.contains_key("meter"));
    assert!(got.iter().all(|r| r.inserted_at.is_some()));

    let raw = PgOrderedSource::new(
        pool.clone(),
        "destination",
        SourceQuery::Raw(format!(
            "select inserted_on, time, id from {table} order by time asc"
        )),
    )?;
    let got_raw: Vec<TimedRecord> = raw.records().try_collect().await?;
    assert_eq!(got_raw.len(), 2);
    assert_eq!(got_raw[0].timestamp, t0);
    assert_eq!(got_raw[0].sequence_id, got[0].sequence_id);
    assert!(got_raw[0].payload.is_empty());

    let bad = PgOrderedSource::new(
        pool.clone(),
        "destination",
        SourceQuery::Raw(format!("select time from {table}")),
    )?;
    let err = bad
        .records()
        .try_collect::<Vec<_>>()
        .await
        .expect_err("one-column rows must be rejected");
    assert!(format!("{err:#}").contains("protocol violation"));

    sqlx::query(&format!("drop table {table}")).execute(&pool).await?;
    sqlx::query(&format!("drop function if exists {table}_stamp_inserted_on()"))
        .execute(&pool)
        .await?;
    Ok(())
}
