use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use tlm_config::{secrets::resolve_store_secrets, RunMode};
use tlm_db::{connect, init_store, CreateStatus};
use tlm_ingest::{run_ingest, IngestOptions, MqttBus, MqttSettings, PgRecordStore};
use tlm_mapping::MessageMapper;

use super::{load_config, shutdown_channel};
use crate::Cli;

pub async fn run(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli, RunMode::Ingest)?;
    let stores = resolve_store_secrets(&cfg, RunMode::Ingest).context("resolve store")?;
    let mapper = MessageMapper::from_spec(&cfg.mapping).context("compile mapping")?;
    let settings = MqttSettings::from_config(&cfg.mqtt).context("mqtt settings")?;

    println!("MQTT server: {}:{}", settings.host, settings.port);
    println!("MQTT topic: {}", settings.topic);
    if let Some(user) = &settings.username {
        println!("MQTT username: {user}");
    }

    let table = stores.primary.table.clone();
    let pool = connect(&stores.primary).await.context("connect store")?;
    let status = init_store(
        &pool,
        &table,
        &mapper.columns(),
        cli.create,
        cfg.mqtt.max_tries,
        Duration::from_secs(cfg.mqtt.retry_delay_secs),
    )
    .await
    .context("init store")?;
    if status == Some(CreateStatus::Created) {
        println!("Created table {table}");
    }

    let mut bus = MqttBus::connect(settings)
        .await
        .context("connect to broker")?;
    let mut store = PgRecordStore::new(pool.clone(), table, cfg.database.key_fields.clone());
    let opts = IngestOptions {
        progress_every: cfg.mqtt.progress_every,
    };

    let shutdown = shutdown_channel();
    let stats = run_ingest(&mut bus, &mapper, &mut store, &opts, shutdown)
        .await
        .context("ingest")?;

    pool.close().await;
    info!(%stats, "ingest finished");
    println!("Ingest finished: {stats}");
    Ok(())
}
