//! End-to-end Integration Tests
//!
//! A full batch through in-memory source, backends and sink.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::NaiveDate;
use lifelog_sync::adapters::{Backend, BackendError};
use lifelog_sync::core::{Ledger, Limits};
use lifelog_sync::domain::{ItemKind, Stage, Transcript};
use tempfile::TempDir;

use common::*;

const GARAGE_A: &str = r#"{
    "projects": [{"title": "Garage cleanup", "priority": "medium", "tags": ["home"]}],
    "tasks": [{"title": "Buy shelves", "project": "Garage cleanup", "due_date": "next Friday"}]
}"#;

const GARAGE_B: &str = r#"```json
{"projects": [{"title": "garage cleanup", "priority": "high", "tags": ["weekend"],
               "summary": "Clear out the garage"}]}
```"#;

const DENTIST_A: &str = r#"{"todos": [{"title": "Call the dentist", "due_date": "tomorrow"}]}"#;
const DENTIST_B: &str = r#"{"todos": ["Call the dentist"]}"#;

fn batch() -> Vec<Transcript> {
    vec![
        Transcript::new(
            "t-garage",
            at(20, 9),
            "Morning walk. TB remind me to start the garage cleanup project and buy shelves by next Friday. Then coffee.",
        ),
        Transcript::new("t-dentist", at(20, 14), "Quick note tb, call the dentist tomorrow."),
        Transcript::new(
            "t-quiet",
            at(20, 18),
            "Just chatting about the weather with nobody in particular.",
        ),
    ]
}

#[tokio::test]
async fn test_three_transcript_batch() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::load(&dir.path().join("state.json")).unwrap();

    let a = Arc::new(
        ScriptedBackend::new("openai:gpt-4o-mini")
            .on("garage", GARAGE_A)
            .on("dentist", DENTIST_A),
    );
    let b = Arc::new(
        ScriptedBackend::new("anthropic:claude")
            .on("garage", GARAGE_B)
            .on("dentist", DENTIST_B),
    );
    let sink = MemorySink::new();

    let summary = orchestrator(
        MemorySource::new(batch()),
        vec![a.clone() as Arc<dyn Backend>, b.clone()],
        sink.clone(),
        Limits::default(),
    )
    .run_until(&mut ledger, window(), std::future::pending())
    .await
    .unwrap();

    // Only the two matching transcripts reached the backends
    assert_eq!(a.calls(), 2);
    assert_eq!(b.calls(), 2);

    // All three are recorded; the quiet one with no records
    for id in ["t-garage", "t-dentist", "t-quiet"] {
        assert!(ledger.is_processed(id), "{} not recorded", id);
    }
    assert!(ledger.state().transcript_to_external_ids["t-quiet"].is_empty());
    assert_eq!(ledger.state().last_run_timestamp, Some(window().end));

    assert_eq!(summary.transcripts_fetched, 3);
    assert_eq!(summary.transcripts_processed, 3);
    assert_eq!(summary.transcripts_without_matches, 1);
    assert!(summary.failures.is_empty());
    assert_eq!(summary.items_created[&ItemKind::Project], 1);
    assert_eq!(summary.items_created[&ItemKind::Task], 1);
    assert_eq!(summary.items_created[&ItemKind::Todo], 1);

    assert_eq!(sink.titles(), vec!["Buy shelves", "Call the dentist", "Garage cleanup"]);
    assert_eq!(sink.sources(), vec!["t-dentist", "t-garage"]);
}

#[tokio::test]
async fn test_overlapping_backends_consolidate() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::load(&dir.path().join("state.json")).unwrap();

    let a = Arc::new(ScriptedBackend::new("a:model").on("garage", GARAGE_A));
    let b = Arc::new(ScriptedBackend::new("b:model").on("garage", GARAGE_B));
    let sink = MemorySink::new();

    orchestrator(
        MemorySource::new(batch()[..1].to_vec()),
        vec![a as Arc<dyn Backend>, b],
        sink.clone(),
        Limits::default(),
    )
    .run_until(&mut ledger, window(), std::future::pending())
    .await
    .unwrap();

    let records = sink.records.lock().unwrap();
    let project = records
        .values()
        .find(|r| r.kind == ItemKind::Project)
        .unwrap();

    // One record for both backends' project, with the merged fields
    assert_eq!(records.values().filter(|r| r.kind == ItemKind::Project).count(), 1);
    assert_eq!(project.title, "Garage cleanup");
    assert_eq!(project.properties["Priority"]["select"]["name"], "High");
    let tags: Vec<&str> = project.properties["Tags"]["multi_select"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(tags, vec!["home", "weekend"]);
    assert_eq!(
        project.properties["Description"]["rich_text"][0]["text"]["content"],
        "Clear out the garage"
    );

    // The task links to the project created moments earlier
    let task = records.values().find(|r| r.kind == ItemKind::Task).unwrap();
    assert_eq!(
        task.parent_external_id,
        Some(format!("page-{}", &project.canonical_id[..12]))
    );
    let friday = NaiveDate::from_ymd_opt(2025, 1, 24).unwrap();
    assert_eq!(task.properties["Due"]["date"]["start"], friday.to_string());
}

#[tokio::test]
async fn test_partial_backend_failure_recorded_once() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::load(&dir.path().join("state.json")).unwrap();

    let good = Arc::new(ScriptedBackend::new("good:model").on("dentist", DENTIST_A));
    let bad = Arc::new(
        ScriptedBackend::new("bad:model").failing(BackendError::Auth("invalid api key".to_string())),
    );
    let sink = MemorySink::new();

    let summary = orchestrator(
        MemorySource::new(vec![batch()[1].clone()]),
        vec![good as Arc<dyn Backend>, bad.clone()],
        sink.clone(),
        Limits::default(),
    )
    .run_until(&mut ledger, window(), std::future::pending())
    .await
    .unwrap();

    assert_eq!(summary.failures_in(Stage::Extract), 1);
    assert_eq!(summary.failures[0].subject, "bad:model");
    assert_eq!(summary.failures[0].transcript_id, "t-dentist");
    // Authentication errors are not retried
    assert_eq!(bad.calls(), 1);

    assert_eq!(sink.titles(), vec!["Call the dentist"]);
    assert!(ledger.is_processed("t-dentist"));
}

#[tokio::test]
async fn test_all_backends_failing_marks_processed_with_no_items() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::load(&dir.path().join("state.json")).unwrap();

    let bad = Arc::new(
        ScriptedBackend::new("bad:model").failing(BackendError::Malformed("not json".to_string())),
    );
    let sink = MemorySink::new();

    let summary = orchestrator(
        MemorySource::new(vec![batch()[1].clone()]),
        vec![bad as Arc<dyn Backend>],
        sink.clone(),
        Limits::default(),
    )
    .run_until(&mut ledger, window(), std::future::pending())
    .await
    .unwrap();

    assert_eq!(summary.transcripts_with_no_items, 1);
    assert_eq!(summary.total_items_created(), 0);
    assert_eq!(sink.upserts.load(Ordering::SeqCst), 0);
    assert!(ledger.is_processed("t-dentist"));
}

#[tokio::test]
async fn test_keyword_filter_disabled_sends_everything() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::load(&dir.path().join("state.json")).unwrap();
    let backend = Arc::new(ScriptedBackend::new("a:model"));

    let keywords = Arc::new(lifelog_sync::config::KeywordSettings {
        filter_enabled: false,
        ..Default::default()
    });
    let limits = Limits::default();
    let invoker = lifelog_sync::core::ExtractionInvoker::new(
        vec![backend.clone() as Arc<dyn Backend>],
        Arc::clone(&keywords),
        limits.clone(),
        fast_retry(),
    );
    let pipeline = lifelog_sync::core::TranscriptPipeline::new(
        lifelog_sync::core::KeywordMatcher::from_settings(&keywords),
        invoker,
        lifelog_sync::core::ItemTransformer::new(keywords),
        MemorySink::new(),
        limits.request_timeout(),
    );

    let summary = lifelog_sync::core::Orchestrator::new(MemorySource::new(batch()), pipeline, limits)
        .run_until(&mut ledger, window(), std::future::pending())
        .await
        .unwrap();

    assert_eq!(backend.calls(), 3);
    assert_eq!(summary.transcripts_without_matches, 0);
    let prompts = backend.prompts.lock().unwrap();
    assert!(prompts.iter().any(|p| p.contains("Just chatting about the weather")));
}

#[tokio::test]
async fn test_absurd_due_date_keeps_sibling_items() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::load(&dir.path().join("state.json")).unwrap();

    let backend = Arc::new(ScriptedBackend::new("openai:gpt-4o-mini").on(
        "garage",
        r#"{"tasks": [{"title": "Buy shelves", "due_date": "in 4000000000 weeks"},
                      {"title": "Sweep floor", "due_date": "in 100000000 days"}],
            "todos": [{"title": "Call the dentist", "due_date": "tomorrow"}]}"#,
    ));
    let sink = MemorySink::new();

    let summary = orchestrator(
        MemorySource::new(batch()[..1].to_vec()),
        vec![backend as Arc<dyn Backend>],
        sink.clone(),
        Limits::default(),
    )
    .run_until(&mut ledger, window(), std::future::pending())
    .await
    .unwrap();

    assert!(summary.failures.is_empty());
    assert_eq!(summary.total_items_created(), 3);
    assert_eq!(
        sink.titles(),
        vec!["Buy shelves", "Call the dentist", "Sweep floor"]
    );
    assert_eq!(ledger.state().transcript_to_external_ids["t-garage"].len(), 3);
}
