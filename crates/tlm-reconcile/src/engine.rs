use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tlm_schemas::{TimeField, TimedRecord};

use crate::report::{DivergenceReporter, ReportSink};
use crate::source::{spawn_producer, CorrectiveWriter, RecordSource};
use crate::{
    BackfillPolicy, Classification, EndState, ReconcileError, ReconcileOptions, ReconcileSummary,
    Side, StreamItem,
};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify `delta = source - destination` against `tolerance`.
///
/// Equal timestamps are always synced, including with a zero tolerance.
pub fn classify(delta: Duration, tolerance: Duration) -> Classification {
    if delta == Duration::zero() || (delta < tolerance && -delta < tolerance) {
        Classification::Synced
    } else if delta < Duration::zero() {
        Classification::SourceBehind
    } else {
        Classification::DestBehind
    }
}

// ---------------------------------------------------------------------------
// Channel reading
// ---------------------------------------------------------------------------

fn cancel_requested(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().is_some_and(|rx| *rx.borrow())
}

async fn recv_or_cancel(
    rx: &mut mpsc::Receiver<StreamItem>,
    shutdown: Option<&mut watch::Receiver<bool>>,
) -> Result<Option<StreamItem>, ReconcileError> {
    let Some(shutdown) = shutdown else {
        return Ok(rx.recv().await);
    };
    if *shutdown.borrow() {
        return Err(ReconcileError::Cancelled);
    }
    loop {
        tokio::select! {
            item = rx.recv() => return Ok(item),
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return Err(ReconcileError::Cancelled),
                Ok(()) => continue,
                // Sender dropped: nobody can cancel any more.
                Err(_) => return Ok(rx.recv().await),
            },
        }
    }
}

/// Consumer end of one producer channel.
struct Lane {
    side: Side,
    rx: mpsc::Receiver<StreamItem>,
    ended: bool,
    consumed: u64,
    last_time: Option<DateTime<Utc>>,
    time_field: TimeField,
    validate_order: bool,
}

impl Lane {
    fn new(side: Side, rx: mpsc::Receiver<StreamItem>, opts: &ReconcileOptions) -> Self {
        Self {
            side,
            rx,
            ended: false,
            consumed: 0,
            last_time: None,
            time_field: opts.time_field,
            validate_order: opts.validate_order,
        }
    }

    /// Comparison time of `record`, or `MissingTimeField`.
    fn time_of(&self, record: &TimedRecord) -> Result<DateTime<Utc>, ReconcileError> {
        record
            .time_of(self.time_field)
            .ok_or(ReconcileError::MissingTimeField {
                side: self.side,
                field: self.time_field,
                sequence_id: record.sequence_id,
            })
    }

    /// Next record, or `None` once `End` was seen. Never reads past `End`.
    async fn pull(
        &mut self,
        shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<Option<(TimedRecord, DateTime<Utc>)>, ReconcileError> {
        if self.ended {
            return Ok(None);
        }
        match recv_or_cancel(&mut self.rx, shutdown).await? {
            Some(StreamItem::Record(record)) => {
                let time = self.time_of(&record)?;
                if self.validate_order {
                    if let Some(previous) = self.last_time {
                        if time < previous {
                            return Err(ReconcileError::OutOfOrder {
                                side: self.side,
                                previous,
                                got: time,
                                sequence_id: record.sequence_id,
                            });
                        }
                    }
                }
                self.last_time = Some(time);
                self.consumed += 1;
                Ok(Some((record, time)))
            }
            Some(StreamItem::End) => {
                debug!(side = %self.side, consumed = self.consumed, "end of stream");
                self.ended = true;
                Ok(None)
            }
            None => Err(ReconcileError::ChannelClosed(self.side)),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparator
// ---------------------------------------------------------------------------

type Head = Option<(TimedRecord, DateTime<Utc>)>;

/// Two-way ordered merge over the two channels.
struct Comparator<'s, 'w> {
    opts: ReconcileOptions,
    source: Lane,
    destination: Lane,
    reporter: DivergenceReporter<'s>,
    writer: Option<&'w mut dyn CorrectiveWriter>,
    shutdown: Option<watch::Receiver<bool>>,
    summary: ReconcileSummary,
    /// Sequence id of the last source record replayed, so a source head that
    /// stays put across several steps is written once.
    last_replayed_source: Option<i64>,
}

impl Comparator<'_, '_> {
    async fn pull(&mut self, side: Side) -> Result<Head, ReconcileError> {
        let lane = match side {
            Side::Source => &mut self.source,
            Side::Destination => &mut self.destination,
        };
        let head = lane.pull(self.shutdown.as_mut()).await?;
        if let Some((_, time)) = &head {
            match side {
                Side::Source => self.summary.last_source = Some(*time),
                Side::Destination => self.summary.last_destination = Some(*time),
            }
        }
        Ok(head)
    }

    fn check_cancel(&self) -> Result<(), ReconcileError> {
        if cancel_requested(&self.shutdown) {
            return Err(ReconcileError::Cancelled);
        }
        Ok(())
    }

    async fn write(&mut self, record: &TimedRecord) -> Result<(), ReconcileError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer
            .backfill(record)
            .await
            .map_err(|e| ReconcileError::BackfillFailed {
                sequence_id: record.sequence_id,
                cause: format!("{e:#}"),
            })?;
        self.summary.backfilled += 1;
        Ok(())
    }

    async fn replay_source(&mut self, record: &TimedRecord) -> Result<(), ReconcileError> {
        if self.last_replayed_source == Some(record.sequence_id) {
            return Ok(());
        }
        self.write(record).await?;
        self.last_replayed_source = Some(record.sequence_id);
        Ok(())
    }

    async fn run(mut self) -> Result<ReconcileSummary, ReconcileError> {
        self.check_cancel()?;
        let mut src = self.pull(Side::Source).await?;
        let mut dst = self.pull(Side::Destination).await?;

        loop {
            self.check_cancel()?;
            match (src.take(), dst.take()) {
                (Some((s, st)), Some((d, dt))) => {
                    self.summary.steps += 1;
                    let step = self.summary.steps;
                    let class = classify(st - dt, self.opts.tolerance);
                    self.reporter.classified(step, class, st, dt);
                    match class {
                        Classification::Synced => {
                            self.summary.synced += 1;
                            src = self.pull(Side::Source).await?;
                            dst = self.pull(Side::Destination).await?;
                        }
                        Classification::SourceBehind => {
                            self.summary.source_behind += 1;
                            src = self.pull(Side::Source).await?;
                            dst = Some((d, dt));
                        }
                        Classification::DestBehind => {
                            self.summary.dest_behind += 1;
                            match self.opts.backfill {
                                BackfillPolicy::Disabled => {}
                                BackfillPolicy::ReplaySource => self.replay_source(&s).await?,
                                BackfillPolicy::ReplayDestination => self.write(&d).await?,
                            }
                            dst = self.pull(Side::Destination).await?;
                            src = Some((s, st));
                        }
                    }
                }
                (None, None) => {
                    self.summary.end = EndState::Both;
                    break;
                }
                (None, Some(head)) => {
                    self.summary.end = EndState::SourceExhausted;
                    self.drain(Side::Destination, head).await?;
                    break;
                }
                (Some(head), None) => {
                    self.summary.end = EndState::DestinationExhausted;
                    self.drain(Side::Source, head).await?;
                    break;
                }
            }
        }

        self.summary.source_records = self.source.consumed;
        self.summary.destination_records = self.destination.consumed;
        self.summary.suppressed = self.reporter.suppressed();
        self.reporter.finished(&self.summary);
        Ok(self.summary)
    }

    /// Report (and possibly backfill) every remaining record of `remaining`.
    async fn drain(
        &mut self,
        remaining: Side,
        first: (TimedRecord, DateTime<Utc>),
    ) -> Result<(), ReconcileError> {
        let exhausted = match remaining {
            Side::Source => Side::Destination,
            Side::Destination => Side::Source,
        };
        self.reporter.drain_started(exhausted);

        let mut head = Some(first);
        while let Some((record, time)) = head {
            self.check_cancel()?;
            self.summary.steps += 1;
            self.summary.drained += 1;
            self.reporter.drained(self.summary.steps, remaining, time);

            if self.opts.backfill_on_drain {
                match (self.opts.backfill, remaining) {
                    (BackfillPolicy::ReplaySource, Side::Source) => {
                        self.replay_source(&record).await?
                    }
                    (BackfillPolicy::ReplayDestination, Side::Destination) => {
                        self.write(&record).await?
                    }
                    _ => {}
                }
            }
            head = self.pull(remaining).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Wires two sources, their producers, the comparator and the reporter.
///
/// ```ignore
/// let summary = Reconciler::new(ReconcileOptions::event_time())
///     .with_writer(&mut writer)
///     .with_shutdown(shutdown_rx)
///     .run(source, destination, &mut StdoutSink)
///     .await?;
/// ```
pub struct Reconciler<'w> {
    opts: ReconcileOptions,
    writer: Option<&'w mut dyn CorrectiveWriter>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<'w> Reconciler<'w> {
    pub fn new(opts: ReconcileOptions) -> Self {
        Self {
            opts,
            writer: None,
            shutdown: None,
        }
    }

    pub fn with_writer(mut self, writer: &'w mut dyn CorrectiveWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Stop between steps once `true` is published on `shutdown`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        if self.opts.backfill != BackfillPolicy::Disabled && self.writer.is_none() {
            return Err(ReconcileError::Misconfigured(format!(
                "backfill policy {} needs a corrective writer",
                self.opts.backfill.as_str()
            )));
        }
        if self.opts.tolerance < Duration::zero() {
            return Err(ReconcileError::Misconfigured(
                "tolerance must not be negative".to_string(),
            ));
        }
        if self.opts.channel_capacity == 0 {
            return Err(ReconcileError::Misconfigured(
                "channel capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn run(
        self,
        source: Box<dyn RecordSource>,
        destination: Box<dyn RecordSource>,
        sink: &mut dyn ReportSink,
    ) -> Result<ReconcileSummary, ReconcileError> {
        self.validate()?;
        debug!(
            source = %source.describe(),
            destination = %destination.describe(),
            time_field = self.opts.time_field.as_str(),
            backfill = self.opts.backfill.as_str(),
            "reconcile starting"
        );

        let (src_tx, src_rx) = mpsc::channel(self.opts.channel_capacity);
        let (dst_tx, dst_rx) = mpsc::channel(self.opts.channel_capacity);
        let src_task = spawn_producer(Side::Source, source, src_tx);
        let dst_task = spawn_producer(Side::Destination, destination, dst_tx);

        let comparator = Comparator {
            source: Lane::new(Side::Source, src_rx, &self.opts),
            destination: Lane::new(Side::Destination, dst_rx, &self.opts),
            reporter: DivergenceReporter::new(
                sink,
                self.opts.report_every,
                self.opts.report_synced,
            ),
            writer: self.writer,
            shutdown: self.shutdown,
            summary: ReconcileSummary::new(),
            last_replayed_source: None,
            opts: self.opts,
        };

        match comparator.run().await {
            Ok(summary) => {
                join_producer(Side::Source, src_task).await?;
                join_producer(Side::Destination, dst_task).await?;
                Ok(summary)
            }
            Err(ReconcileError::ChannelClosed(side)) => {
                let (failed, other) = match side {
                    Side::Source => (src_task, dst_task),
                    Side::Destination => (dst_task, src_task),
                };
                other.abort();
                join_producer(side, failed).await?;
                Err(ReconcileError::ChannelClosed(side))
            }
            Err(e) => {
                src_task.abort();
                dst_task.abort();
                Err(e)
            }
        }
    }
}

/// Await a producer and turn its failure into `SourceFailed`.
async fn join_producer(
    side: Side,
    task: JoinHandle<anyhow::Result<u64>>,
) -> Result<u64, ReconcileError> {
    match task.await {
        Ok(Ok(sent)) => Ok(sent),
        Ok(Err(e)) => {
            warn!(%side, error = %format!("{e:#}"), "producer failed");
            Err(ReconcileError::SourceFailed {
                side,
                cause: format!("{e:#}"),
            })
        }
        Err(join) => {
            let cause = if join.is_panic() {
                format!("producer task panicked: {}", panic_message(join.into_panic()))
            } else {
                format!("producer task cancelled: {join}")
            };
            warn!(%side, error = %cause, "producer died");
            Err(ReconcileError::SourceFailed { side, cause })
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => (*msg).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}
