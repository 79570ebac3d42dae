//! Event Store Integration Tests
//!
//! Tests for event log format, append operations, replay order and run
//! reconstruction.

use rnadeseq::config::paths;
use rnadeseq::core::{cache_key, EventStore};
use rnadeseq::domain::{Event, EventType, Run, RunState, StageStatus};
use tempfile::TempDir;
use uuid::Uuid;

fn stage_event(run_id: Uuid, stage: &str, event_type: EventType, status: StageStatus) -> Event {
    Event::new(
        run_id,
        Some(stage.to_string()),
        event_type,
        cache_key(stage, "Rscript DESeq2.R"),
        format!("Stage '{}'", stage),
        status,
    )
}

fn run_event(run_id: Uuid, event_type: EventType, summary: &str) -> Event {
    Event::new(
        run_id,
        None,
        event_type,
        format!("{}:run", run_id),
        summary.to_string(),
        StageStatus::Running,
    )
}

#[test]
fn test_event_serializes_as_one_json_line() {
    let run_id = Uuid::new_v4();
    let event = stage_event(
        run_id,
        "differential_expression",
        EventType::StageCompleted,
        StageStatus::Completed,
    )
    .with_duration(1500);

    let json = serde_json::to_string(&event).unwrap();
    assert!(!json.contains('\n'));
    assert!(json.contains("\"event_type\":\"stage_completed\""));
    assert!(json.contains("\"status\":\"completed\""));
    assert!(json.contains("\"duration_ms\":1500"));
    assert!(json.contains("\"stage\":\"differential_expression\""));

    let parsed: Event = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.id, event.id);
    assert_eq!(parsed.run_id, run_id);
    assert_eq!(parsed.error, None);
}

#[tokio::test]
async fn test_log_lives_below_the_output_root() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();

    assert_eq!(
        store.run_dir(),
        paths::run_dir(temp.path(), &run_id.to_string())
    );
    assert!(store.run_dir().starts_with(paths::pipeline_info(temp.path())));
    assert!(store.run_dir().is_dir());
    assert!(store.events_path().ends_with("events.jsonl"));
}

#[tokio::test]
async fn test_replay_preserves_append_order() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();

    assert!(store.replay().await.unwrap().is_empty());

    let stages = ["software_versions", "differential_expression", "report"];
    store
        .append(&run_event(run_id, EventType::RunStarted, "run_1"))
        .await
        .unwrap();
    for stage in stages {
        store
            .append(&stage_event(run_id, stage, EventType::StageStarted, StageStatus::Running))
            .await
            .unwrap();
    }

    let events = store.replay().await.unwrap();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].event_type, EventType::RunStarted);
    let replayed: Vec<&str> = events[1..]
        .iter()
        .filter_map(|e| e.stage.as_deref())
        .collect();
    assert_eq!(replayed, stages);

    let raw = std::fs::read_to_string(store.events_path()).unwrap();
    assert_eq!(raw.lines().count(), 4);
}

#[tokio::test]
async fn test_completed_lookup_by_cache_key() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();

    let started = stage_event(run_id, "report", EventType::StageStarted, StageStatus::Running);
    store.append(&started).await.unwrap();
    assert!(!store.is_stage_completed(&started.cache_key).await.unwrap());

    let cached = stage_event(run_id, "report", EventType::StageCached, StageStatus::Cached);
    store.append(&cached).await.unwrap();
    assert!(store.is_stage_completed(&cached.cache_key).await.unwrap());
    assert!(!store.is_stage_completed("report:0000000000000000").await.unwrap());

    let last = store
        .last_event_of_type(EventType::StageCached)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.id, cached.id);
}

#[tokio::test]
async fn test_list_runs_and_open_existing() {
    let temp = TempDir::new().unwrap();
    assert!(EventStore::list_runs(temp.path()).await.unwrap().is_empty());

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    EventStore::open(temp.path(), first).await.unwrap();
    EventStore::open(temp.path(), second).await.unwrap();
    std::fs::create_dir_all(paths::runs_dir(temp.path()).join("not-a-run")).unwrap();

    let mut runs = EventStore::list_runs(temp.path()).await.unwrap();
    runs.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(runs, expected);

    assert!(EventStore::open_existing(temp.path(), first).await.is_ok());
    let missing = EventStore::open_existing(temp.path(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(missing.to_string().contains("Run not found"));
}

#[tokio::test]
async fn test_run_rebuilt_from_log() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();

    let completed = stage_event(
        run_id,
        "differential_expression",
        EventType::StageCompleted,
        StageStatus::Completed,
    );
    for event in [
        run_event(run_id, EventType::RunStarted, "project_x"),
        completed.clone(),
        stage_event(run_id, "pathway_enrichment", EventType::StageFailed, StageStatus::Failed)
            .with_error("'Rscript' exited with code 1".to_string()),
        stage_event(run_id, "report", EventType::StageSkipped, StageStatus::Skipped),
        run_event(run_id, EventType::RunFailed, "Run failed")
            .with_error("failed stages: pathway_enrichment".to_string()),
    ] {
        store.append(&event).await.unwrap();
    }

    let run = Run::from_events(&store.replay().await.unwrap()).unwrap();
    assert_eq!(run.id, run_id);
    assert_eq!(run.name, "project_x");
    assert_eq!(
        run.state,
        RunState::Failed {
            error: "failed stages: pathway_enrichment".to_string()
        }
    );
    assert!(run.completed_at.is_some());
    assert!(!run.is_running());
    assert_eq!(
        run.stage_statuses.get("pathway_enrichment"),
        Some(&StageStatus::Failed)
    );
    assert_eq!(run.stage_statuses.get("report"), Some(&StageStatus::Skipped));
    assert!(run.completed_with_key("differential_expression", &completed.cache_key));
    assert!(!run.completed_with_key("differential_expression", "differential_expression:x"));
    assert!(!run.completed_with_key("pathway_enrichment", &completed.cache_key));
}

#[test]
fn test_empty_log_has_no_run() {
    assert!(Run::from_events(&[]).is_none());
}
