//! tlm-ingest
//!
//! The ingestion path: bus message -> JSON -> mapped row -> store.
//!
//! A message that is not valid JSON, not an object, or does not fit the
//! mapping is logged and skipped. A failed store write ends the run; the
//! caller exits non-zero. A shutdown request disconnects the bus cleanly
//! and returns the counters.

use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tlm_mapping::{MappingError, MessageMapper};
use tlm_schemas::{Payload, TIME_LAYOUT};

pub mod mqtt;
mod store;

pub use mqtt::{parse_server, MqttBus, MqttSettings};
pub use store::PgRecordStore;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Delivers raw messages in arrival order.
#[async_trait]
pub trait MessageBus: Send {
    /// Next message, or `None` once the bus is closed for good.
    async fn next_message(&mut self) -> Result<Option<BusMessage>>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Persists one mapped row.
#[async_trait]
pub trait RecordStore: Send {
    async fn store(&mut self, row: &Payload) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Per-message decoding
// ---------------------------------------------------------------------------

/// Why a message was skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageError {
    InvalidJson(String),
    NotAnObject,
    Mapping(MappingError),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::InvalidJson(e) => write!(f, "JSON unmarshal fails: {e}"),
            MessageError::NotAnObject => write!(f, "message is not a JSON object"),
            MessageError::Mapping(e) => write!(f, "mapping failed: {e}"),
        }
    }
}

impl std::error::Error for MessageError {}

pub fn decode_message(payload: &[u8]) -> Result<Value, MessageError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| MessageError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(MessageError::NotAnObject);
    }
    Ok(value)
}

pub fn map_message(mapper: &MessageMapper, payload: &[u8]) -> Result<Payload, MessageError> {
    let value = decode_message(payload)?;
    mapper.map(&value).map_err(MessageError::Mapping)
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Stored messages between two progress lines. 0 disables them.
    pub progress_every: u64,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            progress_every: tlm_config::DEFAULT_PROGRESS_EVERY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub stored: u64,
    pub skipped: u64,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} stored={} skipped={}",
            self.received, self.stored, self.skipped
        )
    }
}

/// Consume `bus` until it closes or `shutdown` flips to true.
///
/// A store write in progress is never interrupted by a shutdown request;
/// the request is seen before the next receive.
pub async fn run_ingest(
    bus: &mut dyn MessageBus,
    mapper: &MessageMapper,
    store: &mut dyn RecordStore,
    opts: &IngestOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<IngestStats> {
    let mut stats = IngestStats::default();
    info!(mapper = %mapper.describe(), "ingest started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped sender is treated as a shutdown request.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            msg = bus.next_message() => msg.context("receive from message bus")?,
        };

        let Some(msg) = next else {
            info!(%stats, "message bus closed");
            return Ok(stats);
        };
        stats.received += 1;
        debug!(topic = %msg.topic, payload = %String::from_utf8_lossy(&msg.payload), "message");

        let row = match map_message(mapper, &msg.payload) {
            Ok(row) => row,
            Err(e) => {
                stats.skipped += 1;
                warn!(topic = %msg.topic, error = %e, "message skipped");
                continue;
            }
        };

        store
            .store(&row)
            .await
            .with_context(|| format!("store message from {}", msg.topic))?;
        stats.stored += 1;

        if opts.progress_every > 0 && stats.stored % opts.progress_every == 0 {
            println!(
                "Received MQTT msgs: {:04} -> {}",
                stats.stored,
                Utc::now().format(TIME_LAYOUT)
            );
            info!(%stats, "progress");
        }
    }

    info!(%stats, "shutdown requested, disconnecting");
    bus.disconnect()
        .await
        .context("disconnect from message bus")?;
    Ok(stats)
}
