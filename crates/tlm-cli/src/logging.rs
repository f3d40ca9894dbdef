use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "tlm.trace.log";

/// Level implied by `ENABLE_MQTT2DB_DEBUG`.
pub fn level_for(flag: Option<&str>) -> &'static str {
    match flag.map(str::trim) {
        Some("debug") | Some("1") => "debug",
        Some("info") | Some("2") => "info",
        _ => "warn",
    }
}

fn log_path() -> PathBuf {
    let dir = std::env::var_os("LOGPATH")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    dir.join(LOG_FILE_NAME)
}

/// Trace output goes to `$LOGPATH/tlm.trace.log`, or to stderr when the file
/// cannot be opened. `RUST_LOG` wins over `ENABLE_MQTT2DB_DEBUG`.
pub fn init_tracing() {
    let flag = std::env::var("ENABLE_MQTT2DB_DEBUG").ok();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(flag.as_deref())));

    let path = log_path();
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(e) => {
            eprintln!("Error opening log {}: {e}", path.display());
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init()
        }
    }
}
