//! Fan-in Integration Tests
//!
//! Barrier stages wait on every upstream stage; one failed sample makes the
//! joins unreachable while the other branches finish.

mod common;

use std::sync::Arc;

use common::{exit_status, Fixture, MockExecutor};
use rnadeseq::core::pipeline::{
    DIFFERENTIAL_EXPRESSION, MERGE_PROFILES, PREPARE_REFERENCES, REPORT, TAXONOMY_VISUALIZATION,
};
use rnadeseq::domain::{EventType, FailureCause, RunState, StageStatus};

#[tokio::test]
async fn test_one_failed_sample_skips_the_joins() {
    let fixture = Fixture::new();
    let executor = Arc::new(MockExecutor::new().failing("profile_s2", exit_status("humann2", 1)));
    let run = fixture
        .run(
            &fixture.metagenomic_inputs(&["s1", "s2", "s3"]),
            false,
            executor.clone(),
            None,
        )
        .await;

    let outcome = &run.outcome;
    assert!(!outcome.success());
    assert_eq!(outcome.status(PREPARE_REFERENCES), Some(StageStatus::Completed));
    assert_eq!(outcome.status("profile_s1"), Some(StageStatus::Completed));
    assert_eq!(outcome.status("profile_s3"), Some(StageStatus::Completed));
    assert_eq!(outcome.status("profile_s2"), Some(StageStatus::Failed));
    assert_eq!(outcome.status(MERGE_PROFILES), Some(StageStatus::Skipped));
    assert_eq!(outcome.status(TAXONOMY_VISUALIZATION), Some(StageStatus::Skipped));

    // Joins never reached the executor
    let executed = executor.executed();
    assert!(!executed.iter().any(|s| s == MERGE_PROFILES));
    assert!(!executed.iter().any(|s| s == TAXONOMY_VISUALIZATION));

    let failures = outcome.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].stage, "profile_s2");
    assert!(matches!(
        failures[0].cause,
        FailureCause::ExitStatus { code: 1, .. }
    ));

    let merge = &outcome.stages[MERGE_PROFILES];
    assert_eq!(
        merge.skipped_because.as_deref(),
        Some("upstream stage 'profile_s2' failed")
    );
}

#[tokio::test]
async fn test_skips_and_failure_are_recorded() {
    let fixture = Fixture::new();
    let executor = Arc::new(MockExecutor::new().failing("profile_s1", exit_status("humann2", 2)));
    let run = fixture
        .run(
            &fixture.metagenomic_inputs(&["s1", "s2"]),
            false,
            executor,
            None,
        )
        .await;

    let events = run.store.replay().await.unwrap();
    let skipped: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == EventType::StageSkipped)
        .filter_map(|e| e.stage.as_deref())
        .collect();
    assert_eq!(skipped.len(), 2);
    assert!(skipped.contains(&MERGE_PROFILES));
    assert!(skipped.contains(&TAXONOMY_VISUALIZATION));

    let failed = events
        .iter()
        .find(|e| e.event_type == EventType::StageFailed)
        .unwrap();
    assert_eq!(failed.stage.as_deref(), Some("profile_s1"));
    assert!(failed.error.as_deref().unwrap().contains("humann2"));

    let recorded = run.recorded_run().await;
    assert!(matches!(recorded.state, RunState::Failed { ref error } if error.contains("profile_s1")));
    assert_eq!(
        recorded.stage_statuses.get(MERGE_PROFILES),
        Some(&StageStatus::Skipped)
    );
}

#[tokio::test]
async fn test_independent_branch_still_publishes() {
    let fixture = Fixture::new();
    let inputs = fixture.add_metagenomics(fixture.report_inputs(), &["s1", "s2"]);
    let executor = Arc::new(MockExecutor::new().failing("profile_s2", exit_status("humann2", 1)));
    let run = fixture.run(&inputs, true, executor, None).await;

    let outcome = &run.outcome;
    assert!(!outcome.success());
    assert_eq!(outcome.status(DIFFERENTIAL_EXPRESSION), Some(StageStatus::Completed));
    assert_eq!(outcome.status(REPORT), Some(StageStatus::Completed));
    assert_eq!(outcome.status(MERGE_PROFILES), Some(StageStatus::Skipped));
    assert!(run.ctx.outdir.join("report/report.zip").is_file());
    assert!(!run.ctx.outdir.join("metagenomics/metagenomics_tables.zip").exists());
}

#[tokio::test]
async fn test_failed_reference_preparation_skips_every_sample() {
    let fixture = Fixture::new();
    let executor = Arc::new(
        MockExecutor::new().failing(PREPARE_REFERENCES, exit_status("tar", 2)),
    );
    let run = fixture
        .run(
            &fixture.metagenomic_inputs(&["s1", "s2", "s3"]),
            false,
            executor.clone(),
            None,
        )
        .await;

    assert_eq!(executor.executed(), vec![PREPARE_REFERENCES]);
    assert_eq!(run.outcome.skipped().len(), 5);
}
