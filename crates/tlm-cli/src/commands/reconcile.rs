use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use tracing::info;

use tlm_config::{secrets::resolve_store_secrets, BackfillMode, ReconcileConfig, RunMode};
use tlm_db::{connect, PgBackfillWriter, PgOrderedSource, SourceQuery};
use tlm_reconcile::{BackfillPolicy, ReconcileOptions, Reconciler, StdoutSink};

use super::{load_config, shutdown_channel};
use crate::Cli;

/// Largest tolerance a `chrono::Duration` holds in whole seconds.
const MAX_TOLERANCE_SECS: u64 = (i64::MAX / 1000) as u64;

pub fn backfill_policy(mode: BackfillMode) -> BackfillPolicy {
    match mode {
        BackfillMode::Disabled => BackfillPolicy::Disabled,
        BackfillMode::ReplaySource => BackfillPolicy::ReplaySource,
        BackfillMode::ReplayDestination => BackfillPolicy::ReplayDestination,
    }
}

pub fn reconcile_options(cfg: &ReconcileConfig) -> ReconcileOptions {
    ReconcileOptions {
        time_field: cfg.time_field,
        tolerance: Duration::seconds(cfg.tolerance_secs().min(MAX_TOLERANCE_SECS) as i64),
        report_every: cfg.report_every,
        report_synced: cfg.report_synced,
        backfill: backfill_policy(cfg.backfill()),
        backfill_on_drain: cfg.backfill_on_drain,
        validate_order: cfg.validate_order,
        channel_capacity: cfg.channel_capacity,
    }
}

/// Both sides read the same table, or the same caller query when one is set.
pub fn source_query(cfg: &ReconcileConfig, table: &str) -> SourceQuery {
    match &cfg.raw_query {
        Some(sql) => SourceQuery::Raw(sql.clone()),
        None => SourceQuery::Structured {
            table: table.to_string(),
            order_by: cfg.time_field,
        },
    }
}

pub async fn run(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli, RunMode::Reconcile)?;
    let stores = resolve_store_secrets(&cfg, RunMode::Reconcile).context("resolve stores")?;
    let destination = stores
        .destination
        .ok_or_else(|| anyhow!("destination store not resolved"))?;
    let table = stores.primary.table.clone();
    let opts = reconcile_options(&cfg.reconcile);

    println!("Source: {} table {table}", stores.primary.url);
    println!("Destination: {} table {}", destination.url, destination.table);

    // Source read, destination read and the corrective write each get
    // their own pool.
    let src_pool = connect(&stores.primary).await.context("connect source store")?;
    let dst_pool = connect(&destination)
        .await
        .context("connect destination store")?;
    let writer_target = match opts.backfill {
        BackfillPolicy::Disabled => None,
        BackfillPolicy::ReplaySource => Some(&destination),
        BackfillPolicy::ReplayDestination => Some(&stores.primary),
    };
    let mut writer = match writer_target {
        Some(target) => {
            let pool = connect(target).await.context("connect backfill store")?;
            Some(PgBackfillWriter::new(
                pool,
                &target.table,
                cfg.database.key_fields.clone(),
            )?)
        }
        None => None,
    };

    let query = source_query(&cfg.reconcile, &table);
    let source = PgOrderedSource::new(src_pool.clone(), "source", query.clone())?;
    let dest = PgOrderedSource::new(dst_pool.clone(), "destination", query)?;

    let mut reconciler = Reconciler::new(opts).with_shutdown(shutdown_channel());
    if let Some(w) = writer.as_mut() {
        reconciler = reconciler.with_writer(w);
    }
    let summary = reconciler
        .run(Box::new(source), Box::new(dest), &mut StdoutSink)
        .await
        .context("reconcile")?;

    let written = writer.as_ref().map_or(0, PgBackfillWriter::written);
    info!(
        steps = summary.steps,
        backfilled = written,
        end = summary.end.as_str(),
        "reconcile finished"
    );

    src_pool.close().await;
    dst_pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlm_schemas::TimeField;

    #[test]
    fn insertion_time_defaults_to_observational() {
        let cfg = ReconcileConfig {
            time_field: TimeField::Inserted,
            ..ReconcileConfig::default()
        };
        let opts = reconcile_options(&cfg);
        assert_eq!(opts.backfill, BackfillPolicy::Disabled);
        assert_eq!(opts.tolerance, Duration::seconds(60));
    }

    #[test]
    fn event_time_replays_source_with_two_minute_tolerance() {
        let opts = reconcile_options(&ReconcileConfig::default());
        assert_eq!(opts.backfill, BackfillPolicy::ReplaySource);
        assert_eq!(opts.tolerance, Duration::minutes(2));
        assert!(opts.backfill_on_drain);
    }

    #[test]
    fn raw_query_replaces_the_table_scan() {
        let mut cfg = ReconcileConfig::default();
        assert!(matches!(
            source_query(&cfg, "home"),
            SourceQuery::Structured { ref table, order_by: TimeField::Event } if table == "home"
        ));

        cfg.raw_query = Some("select inserted_on, time, id from home".to_string());
        assert!(matches!(source_query(&cfg, "home"), SourceQuery::Raw(_)));
    }

    #[test]
    fn raw_query_runs_are_observational() {
        let cfg = ReconcileConfig {
            raw_query: Some("select inserted_on, time, id from home".to_string()),
            ..ReconcileConfig::default()
        };
        let opts = reconcile_options(&cfg);
        assert_eq!(opts.backfill, BackfillPolicy::Disabled);
    }
}
