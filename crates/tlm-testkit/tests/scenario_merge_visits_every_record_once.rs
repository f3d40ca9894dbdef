//! scenario_merge_visits_every_record_once
//!
//! GREEN when, for sorted inputs of any shape:
//! 1. Reported step numbers are exactly 1..=steps (strictly increasing, no gaps)
//!    when nothing is suppressed.
//! 2. Every record of both streams is consumed once:
//!    `2*synced + source_behind + dest_behind + drained == m + n`.
//! 3. Per side: records consumed equal the input length.

use tlm_reconcile::{
    BackfillPolicy, ReconcileOptions, ReconcileSummary, Reconciler, ReportLine,
};
use tlm_testkit::{records_at, step_lines, VecSource};

/// Deterministic sorted minute offsets with gaps and duplicates.
fn walk(seed: u64, len: usize) -> Vec<i64> {
    let mut state = seed;
    let mut t = 0i64;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            t += ((state >> 33) % 5) as i64;
            t
        })
        .collect()
}

fn verbose() -> ReconcileOptions {
    ReconcileOptions {
        report_every: 1,
        report_synced: true,
        backfill: BackfillPolicy::Disabled,
        validate_order: true,
        ..ReconcileOptions::event_time()
    }
}

async fn run(src: &[i64], dst: &[i64]) -> (ReconcileSummary, Vec<ReportLine>) {
    let mut lines: Vec<ReportLine> = Vec::new();
    let summary = Reconciler::new(verbose())
        .run(
            VecSource::boxed("source", records_at(1, src)),
            VecSource::boxed("destination", records_at(1000, dst)),
            &mut lines,
        )
        .await
        .expect("sorted inputs must reconcile");
    (summary, lines)
}

#[tokio::test]
async fn every_record_visited_once_and_steps_increase() {
    let cases: Vec<(Vec<i64>, Vec<i64>)> = vec![
        (vec![0, 1, 2], vec![0, 1, 2]),
        (vec![0, 10, 20, 30], vec![5, 6, 7]),
        (vec![], vec![0, 1]),
        (vec![3, 4], vec![]),
        (walk(1, 50), walk(2, 37)),
        (walk(7, 5), walk(8, 120)),
        (walk(42, 200), walk(42, 200)),
    ];

    for (src, dst) in cases {
        let (summary, lines) = run(&src, &dst).await;
        let (m, n) = (src.len() as u64, dst.len() as u64);

        assert_eq!(summary.source_records, m, "source count for {src:?}");
        assert_eq!(summary.destination_records, n, "destination count for {dst:?}");
        assert_eq!(
            2 * summary.synced + summary.source_behind + summary.dest_behind + summary.drained,
            m + n
        );
        assert_eq!(
            summary.steps,
            summary.synced + summary.source_behind + summary.dest_behind + summary.drained
        );
        assert_eq!(summary.suppressed, 0);

        let steps: Vec<u64> = step_lines(&lines).iter().map(|s| s.step).collect();
        let expected: Vec<u64> = (1..=summary.steps).collect();
        assert_eq!(steps, expected);
        assert!(matches!(lines.last(), Some(ReportLine::Finished(s)) if *s == summary));
    }
}
