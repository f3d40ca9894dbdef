//! scenario_backfill_trigger
//!
//! GREEN when:
//! 1. Source `[T, T+1, T+5]` against destination `[T, T+1]` (tolerance 2m)
//!    backfills exactly one record, timestamped T+5, as step 3, right after
//!    the destination ends. This is the drain-backfill switch, on by default.
//! 2. With drain backfill off, the same input writes nothing.
//! 3. A destination-only record mid-stream is DEST_BEHIND: `replay_source`
//!    writes the waiting source head once, `replay_destination` writes the
//!    destination record.

use tlm_reconcile::{
    BackfillPolicy, EndState, ReconcileOptions, Reconciler, ReportLine, Tag,
};
use tlm_testkit::{at, records_at, step_lines, RecordingWriter, VecSource};

#[tokio::test]
async fn missing_tail_record_is_backfilled_once() {
    let mut writer = RecordingWriter::new();
    let mut lines: Vec<ReportLine> = Vec::new();

    let summary = Reconciler::new(ReconcileOptions::event_time())
        .with_writer(&mut writer)
        .run(
            VecSource::boxed("source", records_at(1, &[0, 1, 5])),
            VecSource::boxed("destination", records_at(10, &[0, 1])),
            &mut lines,
        )
        .await
        .unwrap();

    assert_eq!(writer.written_times(), vec![at(5)]);
    assert_eq!(writer.written[0].sequence_id, 3);
    assert_eq!(summary.backfilled, 1);
    assert_eq!(summary.end, EndState::DestinationExhausted);
    assert_eq!(summary.steps, 3);

    assert_eq!(lines[0].to_string(), "destination rest");
    let step3 = step_lines(&lines)[0];
    assert_eq!(step3.step, 3);
    assert_eq!(step3.tag, Tag::SourceOnly);
    assert_eq!(step3.source, Some(at(5)));
}

#[tokio::test]
async fn drain_is_observational_when_switched_off() {
    let opts = ReconcileOptions {
        backfill_on_drain: false,
        ..ReconcileOptions::event_time()
    };
    let mut writer = RecordingWriter::new();
    let mut lines: Vec<ReportLine> = Vec::new();

    let summary = Reconciler::new(opts)
        .with_writer(&mut writer)
        .run(
            VecSource::boxed("source", records_at(1, &[0, 1, 5])),
            VecSource::boxed("destination", records_at(10, &[0, 1])),
            &mut lines,
        )
        .await
        .unwrap();

    assert!(writer.written.is_empty());
    assert_eq!(summary.drained, 1);
}

#[tokio::test]
async fn dest_behind_mid_stream_per_policy() {
    // Destination holds an extra record at T+3 that the source lacks.
    let src = [0, 10];
    let dst = [0, 3, 10];

    let mut replay_source = RecordingWriter::new();
    let mut lines: Vec<ReportLine> = Vec::new();
    let summary = Reconciler::new(ReconcileOptions::event_time())
        .with_writer(&mut replay_source)
        .run(
            VecSource::boxed("source", records_at(1, &src)),
            VecSource::boxed("destination", records_at(10, &dst)),
            &mut lines,
        )
        .await
        .unwrap();
    assert_eq!(summary.dest_behind, 1);
    assert_eq!(summary.synced, 2);
    assert_eq!(replay_source.written_times(), vec![at(10)]);
    let diverged = step_lines(&lines);
    assert_eq!(diverged.len(), 1);
    assert_eq!(diverged[0].tag, Tag::DestBehind);
    assert_eq!(diverged[0].step, 2);
    assert_eq!(diverged[0].delta, Some(chrono::Duration::minutes(7)));

    let mut replay_destination = RecordingWriter::new();
    let opts = ReconcileOptions {
        backfill: BackfillPolicy::ReplayDestination,
        ..ReconcileOptions::event_time()
    };
    Reconciler::new(opts)
        .with_writer(&mut replay_destination)
        .run(
            VecSource::boxed("source", records_at(1, &src)),
            VecSource::boxed("destination", records_at(10, &dst)),
            &mut Vec::<ReportLine>::new(),
        )
        .await
        .unwrap();
    assert_eq!(replay_destination.written_times(), vec![at(3)]);
}

#[tokio::test]
async fn source_head_waiting_over_many_steps_is_written_once() {
    let mut writer = RecordingWriter::new();
    Reconciler::new(ReconcileOptions::event_time())
        .with_writer(&mut writer)
        .run(
            VecSource::boxed("source", records_at(1, &[20])),
            VecSource::boxed("destination", records_at(10, &[0, 5, 10, 20])),
            &mut Vec::<ReportLine>::new(),
        )
        .await
        .unwrap();
    assert_eq!(writer.written_times(), vec![at(20)]);
}
