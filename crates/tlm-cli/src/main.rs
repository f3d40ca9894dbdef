//! tlm
//!
//! One binary, two run modes:
//! - default: subscribe to the broker and store every mapped message
//! - `--sync`: reconcile the primary store against the destination store

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

mod commands;
mod logging;

#[derive(Parser, Debug)]
#[command(name = "tlm")]
#[command(about = "MQTT telemetry ingestion and store reconciliation", long_about = None)]
pub struct Cli {
    /// Reconcile the primary store against MQTT_DEST_URL instead of ingesting.
    #[arg(long, default_value_t = false)]
    pub sync: bool,

    /// Layered YAML config; later files override earlier ones.
    #[arg(long = "config")]
    pub config: Vec<String>,

    /// Broker address, e.g. tcp://broker:1883 (overrides MQTT_TOPIC_URL).
    #[arg(long)]
    pub server: Option<String>,

    /// Topic filter to subscribe to (overrides MQTT_TOPIC).
    #[arg(long)]
    pub topic: Option<String>,

    /// Subscription QoS.
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub qos: Option<u8>,

    /// Connection attempts for broker and store before giving up.
    #[arg(long)]
    pub maxtries: Option<u32>,

    /// MQTT client id; random when empty.
    #[arg(long)]
    pub clientid: Option<String>,

    /// Broker user (overrides MQTT_TOPIC_USERNAME).
    #[arg(long)]
    pub username: Option<String>,

    /// Broker password (overrides MQTT_TOPIC_PASSWORD).
    #[arg(long)]
    pub password: Option<String>,

    /// Create the store table if it is missing.
    #[arg(long, default_value_t = false)]
    pub create: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Dev-time bootstrap; a missing file is fine.
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();
    logging::init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.sync {
        commands::reconcile::run(&cli).await
    } else {
        commands::ingest::run(&cli).await
    }
}
