//! Per-transcript pipeline and the shared retry policy.
//!
//! One transcript moves through strictly sequential stages:
//! match → extract → consolidate → transform → upsert.
//! Stage failures below the transcript level are recorded in the
//! [`TranscriptReport`] rather than returned as errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::consolidator::consolidate;
use super::invoker::ExtractionInvoker;
use super::matcher::KeywordMatcher;
use super::transformer::{ItemTransformer, ProjectLinks};
use crate::adapters::{BackendError, RecordSink};
use crate::domain::{ConsolidatedItem, FailureRecord, ItemKind, Stage, Transcript};

/// Retry policy for transient failures of external calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Upper bound on the wall time of one retried call whose attempts each
    /// take at most `per_attempt`, including every backoff sleep
    pub fn budget(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        per_attempt
            .saturating_mul(attempts)
            .saturating_add(self.max_delay().saturating_mul(attempts - 1))
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Only [`BackendError::is_transient`] failures are retried. A rate-limit
/// `Retry-After` stretches the delay, still capped at the policy maximum.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                let mut delay = policy.delay_for_attempt(attempt);
                if let BackendError::RateLimited {
                    retry_after: Some(after),
                } = &e
                {
                    delay = delay.max(*after).min(policy.max_delay());
                }

                warn!(
                    call = %label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(call = %label, attempt, error = %e, "Call failed, attempts exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Outcome of one transcript's pipeline
#[derive(Debug, Clone, Default)]
pub struct TranscriptReport {
    pub transcript_id: String,

    /// At least one keyword context (or filtering disabled)
    pub matched: bool,

    /// Consolidated items produced
    pub items: usize,

    /// Successfully upserted records
    pub created: Vec<(ItemKind, String)>,

    pub failures: Vec<FailureRecord>,
}

/// Everything a transcript needs to go from text to upserted records
#[derive(Clone)]
pub struct TranscriptPipeline {
    matcher: Arc<KeywordMatcher>,
    invoker: ExtractionInvoker,
    transformer: Arc<ItemTransformer>,
    sink: Arc<dyn RecordSink>,
    upsert_timeout: Duration,
}

impl TranscriptPipeline {
    pub fn new(
        matcher: KeywordMatcher,
        invoker: ExtractionInvoker,
        transformer: ItemTransformer,
        sink: Arc<dyn RecordSink>,
        upsert_timeout: Duration,
    ) -> Self {
        Self {
            matcher: Arc::new(matcher),
            invoker,
            transformer: Arc::new(transformer),
            sink,
            upsert_timeout,
        }
    }

    pub fn matcher(&self) -> &KeywordMatcher {
        &self.matcher
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.invoker.backend_ids()
    }

    /// Run every stage for one transcript
    #[instrument(skip(self, transcript), fields(transcript = %transcript.id))]
    pub async fn process(&self, transcript: &Transcript) -> TranscriptReport {
        let mut report = TranscriptReport {
            transcript_id: transcript.id.clone(),
            ..Default::default()
        };

        let matches: Vec<_> = self.matcher.matches(transcript).collect();
        if matches.is_empty() {
            debug!("No keyword matches, skipping extraction");
            return report;
        }
        report.matched = true;

        let extraction = self.invoker.extract(transcript, &matches).await;
        for (backend, result) in &extraction {
            if let Err(e) = result {
                report.failures.push(FailureRecord {
                    stage: Stage::Extract,
                    transcript_id: transcript.id.clone(),
                    subject: backend.clone(),
                    error: e.to_string(),
                });
            }
        }
        if !extraction.is_empty() && extraction.values().all(|r| r.is_err()) {
            warn!(backends = extraction.len(), "Every backend failed; transcript has no items");
        }

        let items = consolidate(&transcript.id, &extraction);
        report.items = items.len();

        // Projects go first so tasks can link to them
        let (projects, rest): (Vec<&ConsolidatedItem>, Vec<&ConsolidatedItem>) =
            items.iter().partition(|i| i.kind == ItemKind::Project);
        let mut links = ProjectLinks::new();

        for item in projects.into_iter().chain(rest) {
            match self.upsert(item, &links).await {
                Ok(external_id) => {
                    if item.kind == ItemKind::Project {
                        links.register(&item.title, &external_id);
                    }
                    report.created.push((item.kind, external_id));
                }
                Err(e) => {
                    warn!(canonical_id = %item.canonical_id, title = %item.title, error = %e, "Upsert failed");
                    report.failures.push(FailureRecord {
                        stage: Stage::Upsert,
                        transcript_id: transcript.id.clone(),
                        subject: item.canonical_id.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        info!(
            items = report.items,
            created = report.created.len(),
            failures = report.failures.len(),
            "Transcript pipeline finished"
        );
        report
    }

    async fn upsert(&self, item: &ConsolidatedItem, links: &ProjectLinks) -> anyhow::Result<String> {
        let record = self.transformer.transform(item, links);
        match tokio::time::timeout(self.upsert_timeout, self.sink.upsert(&record)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "{} upsert timed out after {}s",
                self.sink.name(),
                self.upsert_timeout.as_secs()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::adapters::{Backend, DryRunSink};
    use crate::config::KeywordSettings;
    use crate::core::safety::Limits;
    use crate::domain::ExternalRecord;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_budget_covers_every_attempt_and_backoff() {
        let policy = RetryPolicy::default();
        // 3 attempts of 60s plus two sleeps of at most 30s
        assert_eq!(policy.budget(Duration::from_secs(60)), Duration::from_secs(240));

        let single = RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        };
        assert_eq!(single.budget(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_policy_yaml_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5\n").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_transient_errors_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = tokio_test::block_on(with_retry(&fast_retry(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BackendError::RateLimited { retry_after: None })
                } else {
                    Ok(n)
                }
            }
        }));

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = tokio_test::block_on(with_retry(&fast_retry(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Auth("bad key".to_string())) }
        }));

        assert!(matches!(result, Err(BackendError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attempts_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = tokio_test::block_on(with_retry(&fast_retry(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Transient("503".to_string())) }
        }));

        assert!(matches!(result, Err(BackendError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl Backend for Fixed {
        fn id(&self) -> &str {
            "fixed:model"
        }

        async fn invoke(&self, _prompt: &str, _timeout: Duration) -> Result<String, BackendError> {
            Ok(self.0.to_string())
        }
    }

    /// Answers with the response whose marker appears in the prompt
    struct ByMarker(&'static [(&'static str, &'static str)]);

    #[async_trait]
    impl Backend for ByMarker {
        fn id(&self) -> &str {
            "marker:model"
        }

        async fn invoke(&self, prompt: &str, _timeout: Duration) -> Result<String, BackendError> {
            Ok(self
                .0
                .iter()
                .find(|(marker, _)| prompt.contains(marker))
                .map(|(_, response)| response.to_string())
                .unwrap_or_else(|| "{}".to_string()))
        }
    }

    struct FailingTodos;

    #[async_trait]
    impl RecordSink for FailingTodos {
        fn name(&self) -> &str {
            "failing"
        }

        async fn upsert(&self, record: &ExternalRecord) -> anyhow::Result<String> {
            if record.kind == ItemKind::Todo {
                anyhow::bail!("validation error");
            }
            Ok(format!("page-{}", record.canonical_id))
        }
    }

    fn pipeline(response: &'static str, sink: Arc<dyn RecordSink>) -> TranscriptPipeline {
        pipeline_with(Arc::new(Fixed(response)), sink)
    }

    fn pipeline_with(backend: Arc<dyn Backend>, sink: Arc<dyn RecordSink>) -> TranscriptPipeline {
        let keywords = Arc::new(KeywordSettings::default());
        let invoker = ExtractionInvoker::new(
            vec![backend],
            Arc::clone(&keywords),
            Limits::default(),
            fast_retry(),
        );
        TranscriptPipeline::new(
            KeywordMatcher::from_settings(&keywords),
            invoker,
            ItemTransformer::new(keywords),
            sink,
            Duration::from_secs(5),
        )
    }

    fn transcript(text: &str) -> Transcript {
        Transcript::new("t1", Utc.with_ymd_and_hms(2025, 1, 20, 9, 0, 0).unwrap(), text)
    }

    const RESPONSE: &str = r#"{
        "projects": [{"title": "Garage cleanup"}],
        "tasks": [{"title": "Buy shelves", "project": "Garage Cleanup"}],
        "todos": ["Call mom"]
    }"#;

    #[tokio::test]
    async fn test_projects_upserted_before_tasks_and_linked() {
        let sink = Arc::new(DryRunSink::new());
        let pipeline = pipeline(RESPONSE, sink.clone());

        let report = pipeline.process(&transcript("TB start the garage cleanup")).await;
        assert!(report.matched);
        assert_eq!(report.items, 3);
        assert_eq!(report.created.len(), 3);
        assert!(report.failures.is_empty());

        let records = sink.records().await;
        let project = &records[0];
        assert_eq!(project.kind, ItemKind::Project);
        let task = records.iter().find(|r| r.kind == ItemKind::Task).unwrap();
        assert_eq!(
            task.parent_external_id,
            Some(format!("dry-run-{}", project.canonical_id))
        );
    }

    #[tokio::test]
    async fn test_no_match_skips_extraction() {
        let sink = Arc::new(DryRunSink::new());
        let pipeline = pipeline(RESPONSE, sink.clone());

        let report = pipeline.process(&transcript("nothing to see here")).await;
        assert!(!report.matched);
        assert_eq!(report.items, 0);
        assert!(sink.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_failure_does_not_block_siblings() {
        let pipeline = pipeline(RESPONSE, Arc::new(FailingTodos));

        let report = pipeline.process(&transcript("TB garage")).await;
        assert_eq!(report.created.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, Stage::Upsert);
    }

    #[tokio::test]
    async fn test_tasks_never_link_to_another_transcripts_project() {
        let sink = Arc::new(DryRunSink::new());
        let backend = ByMarker(&[
            ("garage", r#"{"projects": [{"title": "Garage cleanup"}]}"#),
            ("shelves", r#"{"tasks": [{"title": "Buy shelves", "project": "Garage cleanup"}]}"#),
        ]);
        let pipeline = pipeline_with(Arc::new(backend), sink.clone());

        pipeline.process(&transcript("TB start the garage cleanup")).await;
        let mut later = transcript("TB buy shelves");
        later.id = "t2".to_string();
        let report = pipeline.process(&later).await;
        assert_eq!(report.created.len(), 1);

        let records = sink.records().await;
        let task = records.iter().find(|r| r.kind == ItemKind::Task).unwrap();
        assert!(task.parent_external_id.is_none());
    }
}
