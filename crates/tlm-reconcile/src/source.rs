use anyhow::Context;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tlm_schemas::TimedRecord;

use crate::{Side, StreamItem};

// ---------------------------------------------------------------------------
// Source contract
// ---------------------------------------------------------------------------

/// A finite, time-ordered stream of records.
///
/// Implementations must yield records in non-decreasing order of the time
/// field the run compares on. The engine does not sort.
pub trait RecordSource: Send + Sync {
    /// Short label for logs, e.g. `"pg:telemetry"`.
    fn describe(&self) -> String;

    /// Stream every record once. An `Err` item aborts the stream.
    fn records(&self) -> BoxStream<'_, anyhow::Result<TimedRecord>>;
}

// ---------------------------------------------------------------------------
// Corrective writer contract
// ---------------------------------------------------------------------------

/// Re-inserts a record into the store that is missing it.
///
/// Called at most once per record. Failures propagate and abort the run.
#[async_trait::async_trait]
pub trait CorrectiveWriter: Send {
    async fn backfill(&mut self, record: &TimedRecord) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Producer task
// ---------------------------------------------------------------------------

/// Drive `source` into `tx` on a new task.
///
/// Sends every record, then one `End`. On a query failure the task returns
/// the error without sending `End`, which closes the channel; the consumer
/// then awaits this handle to learn the cause. If the consumer goes away the
/// task stops quietly.
pub fn spawn_producer(
    side: Side,
    source: Box<dyn RecordSource>,
    tx: mpsc::Sender<StreamItem>,
) -> JoinHandle<anyhow::Result<u64>> {
    tokio::spawn(async move {
        let label = source.describe();
        debug!(%side, source = %label, "producer started");

        let mut sent: u64 = 0;
        let mut records = source.records();
        while let Some(next) = records.next().await {
            let record = next.with_context(|| format!("{side} query on {label}"))?;
            if tx.send(StreamItem::Record(record)).await.is_err() {
                debug!(%side, sent, "consumer gone, producer stopping");
                return Ok(sent);
            }
            sent += 1;
        }

        if tx.send(StreamItem::End).await.is_err() {
            debug!(%side, sent, "consumer gone before end of stream");
        }
        info!(%side, source = %label, sent, "query ended");
        Ok(sent)
    })
}
