//! Timeout Integration Tests
//!
//! Per-request and whole-batch timeouts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use lifelog_sync::adapters::Backend;
use lifelog_sync::core::{Ledger, Limits};
use lifelog_sync::domain::{Stage, Transcript};
use tempfile::TempDir;

use common::*;

#[tokio::test]
async fn test_slow_backend_times_out_and_is_retried() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::load(&dir.path().join("state.json")).unwrap();
    let slow = Arc::new(
        ScriptedBackend::new("slow:model")
            .on("TB", r#"{"todos": ["Never arrives"]}"#)
            .with_delay(Duration::from_secs(30)),
    );
    let limits = Limits {
        request_timeout_seconds: 1,
        ..Default::default()
    };

    let summary = orchestrator(
        MemorySource::new(vec![Transcript::new("t1", at(20, 9), "TB note this")]),
        vec![slow.clone() as Arc<dyn Backend>],
        MemorySink::new(),
        limits,
    )
    .run_until(&mut ledger, window(), std::future::pending())
    .await
    .unwrap();

    // Timeouts are transient: every attempt was made
    assert_eq!(slow.calls(), fast_retry().max_attempts as usize);
    assert_eq!(summary.failures_in(Stage::Extract), 1);
    assert!(summary.failures[0].error.contains("timed out"));
    assert_eq!(summary.transcripts_with_no_items, 1);
    assert!(ledger.is_processed("t1"));
}

#[tokio::test]
async fn test_batch_timeout_stops_in_flight_work() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::load(&dir.path().join("state.json")).unwrap();
    let slow = Arc::new(
        ScriptedBackend::new("slow:model")
            .on("TB", r#"{"todos": ["Never arrives"]}"#)
            .with_delay(Duration::from_secs(30)),
    );
    let limits = Limits {
        run_timeout_seconds: 1,
        ..Default::default()
    };

    let started = std::time::Instant::now();
    let summary = orchestrator(
        MemorySource::new(vec![
            Transcript::new("quick", at(20, 8), "no trigger here"),
            Transcript::new("stuck", at(20, 9), "TB note this"),
        ]),
        vec![slow as Arc<dyn Backend>],
        MemorySink::new(),
        limits,
    )
    .run_until(&mut ledger, window(), std::future::pending())
    .await
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(summary.cancelled);
    assert!(ledger.is_processed("quick"));
    assert!(!ledger.is_processed("stuck"));
}
