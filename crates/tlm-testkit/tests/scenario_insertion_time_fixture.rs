//! scenario_insertion_time_fixture
//!
//! GREEN when the insertion-time variant, fed from CSV fixtures, compares
//! on `inserted_on` (not event time) with a 1 minute tolerance and stays
//! observational: the two rows the source persisted late show up as
//! destination-behind and drain steps, and nothing is written.

use tlm_reconcile::{EndState, ReconcileOptions, Reconciler, ReportLine, Tag};
use tlm_testkit::{load_records_csv, step_lines, RecordingWriter, VecSource};

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

#[tokio::test]
async fn late_persisted_rows_diverge_on_insertion_time() {
    let source = load_records_csv(&fixture("source.csv")).unwrap();
    let destination = load_records_csv(&fixture("destination.csv")).unwrap();
    assert_eq!(source.len(), 4);
    assert!(destination.iter().all(|r| r.inserted_at.is_some()));

    let opts = ReconcileOptions {
        validate_order: true,
        ..ReconcileOptions::insertion_time()
    };
    let mut writer = RecordingWriter::new();
    let mut lines: Vec<ReportLine> = Vec::new();
    let summary = Reconciler::new(opts)
        .with_writer(&mut writer)
        .run(
            VecSource::boxed("source", source),
            VecSource::boxed("destination", destination),
            &mut lines,
        )
        .await
        .unwrap();

    assert_eq!(summary.synced, 2);
    assert_eq!(summary.dest_behind, 2);
    assert_eq!(summary.drained, 2);
    assert_eq!(summary.end, EndState::DestinationExhausted);
    assert!(writer.written.is_empty());

    let printed: Vec<(u64, Tag)> = step_lines(&lines).iter().map(|s| (s.step, s.tag)).collect();
    assert_eq!(
        printed,
        vec![(3, Tag::DestBehind), (5, Tag::SourceOnly), (6, Tag::SourceOnly)]
    );
}

#[test]
fn bad_fixture_time_is_an_error() {
    let err = load_records_csv(&fixture("bad_time.csv")).unwrap_err();
    assert!(format!("{err:#}").contains("parse time"));
    assert!(load_records_csv(&fixture("missing.csv")).is_err());
}
