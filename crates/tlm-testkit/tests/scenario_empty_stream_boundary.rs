//! scenario_empty_stream_boundary
//!
//! GREEN when an empty stream on either side sends the engine straight into
//! drain at step 1: a single rest header, one drain line per record of the
//! other side, and no classify step at all.

use tlm_reconcile::{
    BackfillPolicy, EndState, ReconcileOptions, Reconciler, ReportLine, Tag,
};
use tlm_testkit::{at, records_at, step_lines, VecSource};

fn observe() -> ReconcileOptions {
    ReconcileOptions {
        backfill: BackfillPolicy::Disabled,
        ..ReconcileOptions::event_time()
    }
}

#[tokio::test]
async fn empty_destination_drains_every_source_record() {
    let mut lines: Vec<ReportLine> = Vec::new();
    let summary = Reconciler::new(observe())
        .run(
            VecSource::boxed("source", records_at(1, &[0, 1, 2])),
            VecSource::boxed("destination", Vec::new()),
            &mut lines,
        )
        .await
        .unwrap();

    assert_eq!(summary.end, EndState::DestinationExhausted);
    assert_eq!(summary.synced + summary.source_behind + summary.dest_behind, 0);
    assert_eq!(summary.drained, 3);
    assert_eq!(summary.last_destination, None);
    assert_eq!(summary.last_source, Some(at(2)));

    assert_eq!(lines[0], ReportLine::DrainStarted { exhausted: tlm_reconcile::Side::Destination });
    assert_eq!(lines[0].to_string(), "destination rest");
    let drained: Vec<(u64, Tag)> = step_lines(&lines).iter().map(|s| (s.step, s.tag)).collect();
    assert_eq!(
        drained,
        vec![(1, Tag::SourceOnly), (2, Tag::SourceOnly), (3, Tag::SourceOnly)]
    );
    assert!(lines[1].to_string().starts_with("0000001: S S: 2024-01-01T00:00:00"));
}

#[tokio::test]
async fn empty_source_drains_every_destination_record() {
    let mut lines: Vec<ReportLine> = Vec::new();
    let summary = Reconciler::new(observe())
        .run(
            VecSource::boxed("source", Vec::new()),
            VecSource::boxed("destination", records_at(1, &[7, 8])),
            &mut lines,
        )
        .await
        .unwrap();

    assert_eq!(summary.end, EndState::SourceExhausted);
    assert_eq!(summary.drained, 2);
    assert_eq!(lines[0].to_string(), "source rest");
    let tags: Vec<Tag> = step_lines(&lines).iter().map(|s| s.tag).collect();
    assert_eq!(tags, vec![Tag::DestOnly, Tag::DestOnly]);
}
