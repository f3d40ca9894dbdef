//! Command handlers for the `tlm` binary.
//!
//! Shared wiring lives here: config layering and the shutdown channel.
//! Mode-specific logic lives in the submodules.

pub mod ingest;
pub mod reconcile;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use tlm_config::{
    env_var, load_layered_yaml, report_unused_keys, LoadedConfig, RunMode, TlmConfig,
    UnusedKeyPolicy,
};

use crate::Cli;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// YAML layers, then the environment, then flags. Later layers win.
pub fn load_config(cli: &Cli, mode: RunMode) -> Result<TlmConfig> {
    let loaded = if cli.config.is_empty() {
        LoadedConfig::empty()
    } else {
        load_layered_yaml(&cli.config)
    }
    .context("load config")?;

    let report = report_unused_keys(mode, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    for key in &report.unused_leaf_pointers {
        warn!(mode = mode.as_str(), key = %key, "config key not used in this mode");
    }

    let mut cfg = TlmConfig::from_json(&loaded.config_json).context("load config")?;
    cfg.apply_env(&env_var).context("apply environment")?;
    apply_flags(&mut cfg, cli);

    info!(
        mode = mode.as_str(),
        config_hash = %loaded.config_hash,
        layers = cli.config.len(),
        "config loaded"
    );
    Ok(cfg)
}

/// Command-line flags override everything else.
pub fn apply_flags(cfg: &mut TlmConfig, cli: &Cli) {
    if let Some(v) = &cli.server {
        cfg.mqtt.server = v.clone();
    }
    if let Some(v) = &cli.topic {
        cfg.mqtt.topic = v.clone();
    }
    if let Some(v) = cli.qos {
        cfg.mqtt.qos = v;
    }
    if let Some(v) = cli.maxtries {
        cfg.mqtt.max_tries = v;
    }
    if let Some(v) = &cli.clientid {
        cfg.mqtt.client_id = v.clone();
    }
    if let Some(v) = &cli.username {
        cfg.mqtt.username = v.clone();
    }
    if let Some(v) = &cli.password {
        cfg.mqtt.password = v.clone();
    }
    cfg.fill_defaults();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Publishes `true` on Ctrl-C or SIGTERM.
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, shutting down");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn flags_override_config_and_keep_the_rest() {
        let mut cfg = TlmConfig::default();
        cfg.mqtt.server = "tcp://from-env:1883".to_string();
        cfg.mqtt.username = "env-user".to_string();
        cfg.mqtt.topic = String::new();

        let cli = Cli::parse_from(["tlm", "--server", "tcp://flag:1884", "--qos", "2"]);
        apply_flags(&mut cfg, &cli);

        assert_eq!(cfg.mqtt.server, "tcp://flag:1884");
        assert_eq!(cfg.mqtt.qos, 2);
        assert_eq!(cfg.mqtt.username, "env-user");
        assert_eq!(cfg.mqtt.topic, tlm_config::DEFAULT_TOPIC);
    }

    #[test]
    fn qos_above_two_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["tlm", "--qos", "3"]).is_err());
    }
}
