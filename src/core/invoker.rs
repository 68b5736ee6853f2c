//! Extraction invoker.
//!
//! Sends one transcript's context to every configured backend concurrently
//! and returns, per backend, either the parsed items or the failure. A failing
//! backend never affects the others.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use super::parse::{parse_response, ParseContext};
use super::pipeline::{with_retry, RetryPolicy};
use super::safety::{truncate_to_bytes, Limits};
use crate::adapters::{Backend, BackendError};
use crate::config::KeywordSettings;
use crate::domain::{ContextMatch, ExtractedItem, MatchScope, Transcript};

/// Outcome of one backend for one transcript
pub type BackendResult = Result<Vec<ExtractedItem>, BackendError>;

/// Per-backend results keyed by backend id
pub type Extraction = BTreeMap<String, BackendResult>;

#[derive(Clone)]
pub struct ExtractionInvoker {
    backends: Vec<Arc<dyn Backend>>,
    keywords: Arc<KeywordSettings>,
    limits: Limits,
    retry: RetryPolicy,
}

impl ExtractionInvoker {
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        keywords: Arc<KeywordSettings>,
        limits: Limits,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backends,
            keywords,
            limits,
            retry,
        }
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id().to_string()).collect()
    }

    /// Query every backend for `transcript`
    #[instrument(skip(self, transcript, matches), fields(transcript = %transcript.id, contexts = matches.len()))]
    pub async fn extract(&self, transcript: &Transcript, matches: &[ContextMatch]) -> Extraction {
        let prompt: Arc<str> = build_prompt(transcript, matches, &self.keywords, self.limits.max_prompt_bytes).into();
        let mut set = JoinSet::new();

        for backend in &self.backends {
            let backend = Arc::clone(backend);
            let prompt = Arc::clone(&prompt);
            let keywords = Arc::clone(&self.keywords);
            let limits = self.limits.clone();
            let retry = self.retry.clone();
            let transcript_id = transcript.id.clone();
            let reference_date = transcript.reference_date();

            set.spawn(async move {
                let id = backend.id().to_string();
                let result = invoke_one(backend.as_ref(), &prompt, &limits, &retry)
                    .await
                    .and_then(|raw| {
                        let ctx = ParseContext {
                            backend_id: &id,
                            transcript_id: &transcript_id,
                            reference_date,
                            keywords: &keywords,
                        };
                        parse_response(&raw, &ctx)
                    })
                    .map(collapse_duplicates);
                (id, result)
            });
        }

        let mut results = Extraction::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, result)) => {
                    match &result {
                        Ok(items) => debug!(backend = %id, items = items.len(), "Backend succeeded"),
                        Err(e) => warn!(backend = %id, error = %e, "Backend failed"),
                    }
                    results.insert(id, result);
                }
                Err(e) => warn!(error = %e, "Backend task ended abnormally"),
            }
        }

        // A panicked task cannot report its id; record it as failed by elimination
        for id in self.backend_ids() {
            results
                .entry(id)
                .or_insert_with(|| Err(BackendError::Transient("backend task aborted".to_string())));
        }

        results
    }
}

/// One backend call with timeout, retries and response size check
async fn invoke_one(
    backend: &dyn Backend,
    prompt: &str,
    limits: &Limits,
    retry: &RetryPolicy,
) -> Result<String, BackendError> {
    let timeout = limits.request_timeout();
    let raw = with_retry(retry, backend.id(), || async move {
        tokio::time::timeout(timeout, backend.invoke(prompt, timeout))
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
    })
    .await?;

    limits
        .validate_response(&raw)
        .map_err(|e| BackendError::Malformed(e.to_string()))?;
    Ok(raw)
}

/// Keep the first of several items sharing kind and normalized title
fn collapse_duplicates(items: Vec<ExtractedItem>) -> Vec<ExtractedItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.similarity_key()))
        .collect()
}

/// Build the extraction prompt for one transcript
pub fn build_prompt(
    transcript: &Transcript,
    matches: &[ContextMatch],
    keywords: &KeywordSettings,
    max_bytes: usize,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "The transcript was recorded on {} ({}). Resolve relative dates against that day \
and report due dates as YYYY-MM-DD.\n\n",
        transcript.reference_date(),
        transcript.reference_date().format("%A")
    ));

    prompt.push_str(
        "Return a JSON object with three arrays: \"projects\", \"tasks\" and \"todos\". \
Each entry has \"title\", \"summary\", \"priority\" (high, medium or low), \"status\" \
(not started, in progress or done), \"due_date\" (optional) and \"tags\" (array of strings). \
Tasks may name their parent project in \"project\". Optional \"meetings\" (title, date, \
participants, agenda, location), \"research\" (topic, questions) and \"messages\" \
(recipient, content) arrays may also be returned. Only include items the speaker \
actually committed to or asked for.\n\n",
    );

    let hints: Vec<String> = keywords
        .priority_keywords
        .iter()
        .rev()
        .filter(|(_, words)| !words.is_empty())
        .map(|(priority, words)| format!("{:?}: {}", priority, words.join(", ")).to_lowercase())
        .collect();
    if !hints.is_empty() {
        prompt.push_str(&format!("Priority cues: {}.\n", hints.join("; ")));
    }

    if !keywords.project_category_keywords.is_empty() {
        let categories: Vec<&str> = keywords
            .project_category_keywords
            .keys()
            .map(String::as_str)
            .collect();
        prompt.push_str(&format!("Known project categories: {}.\n", categories.join(", ")));
    }

    if let Some(title) = &transcript.title {
        prompt.push_str(&format!("\nTranscript title: {}\n", title));
    }

    match matches.first().map(|m| m.scope) {
        Some(MatchScope::WholeTranscript) | None => {
            prompt.push_str("\nTranscript:\n");
            prompt.push_str(&transcript.text);
        }
        Some(MatchScope::Keyword) => {
            prompt.push_str(
                "\nThe speaker addressed the assistant with a trigger word, shown in brackets. \
Excerpts:\n",
            );
            for (i, m) in matches.iter().enumerate() {
                prompt.push_str(&format!("\n{}. {}\n", i + 1, m.full_context()));
            }
        }
    }

    truncate_to_bytes(&prompt, max_bytes).to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::core::matcher::KeywordMatcher;
    use crate::domain::ItemKind;

    struct Scripted {
        id: String,
        responses: Vec<Result<String, BackendError>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(id: &str, responses: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                responses,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Backend for Scripted {
        fn id(&self) -> &str {
            &self.id
        }

        async fn invoke(&self, _prompt: &str, _timeout: Duration) -> Result<String, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let last = self.responses.len() - 1;
            self.responses[n.min(last)].clone()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    fn transcript() -> Transcript {
        Transcript::new(
            "t1",
            Utc.with_ymd_and_hms(2025, 1, 20, 9, 0, 0).unwrap(),
            "TB remind me to buy milk",
        )
    }

    fn invoker(backends: Vec<Arc<dyn Backend>>) -> ExtractionInvoker {
        ExtractionInvoker::new(
            backends,
            Arc::new(KeywordSettings::default()),
            Limits::default(),
            fast_retry(),
        )
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let good = Scripted::new("good:model", vec![Ok(r#"{"todos": ["Buy milk", "buy  MILK"]}"#.to_string())]);
        let bad = Scripted::new("bad:model", vec![Err(BackendError::Auth("401".to_string()))]);
        let invoker = invoker(vec![good.clone() as Arc<dyn Backend>, bad.clone()]);

        let results = invoker.extract(&transcript(), &[]).await;

        assert_eq!(results.len(), 2);
        let items = results["good:model"].as_ref().unwrap();
        // Same-title duplicates within one backend collapse
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ItemKind::Todo);
        assert!(matches!(results["bad:model"], Err(BackendError::Auth(_))));
        // Permanent failures are not retried
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let flaky = Scripted::new(
            "flaky:model",
            vec![
                Err(BackendError::Transient("502".to_string())),
                Ok(r#"{"tasks": [{"title": "Ship it"}]}"#.to_string()),
            ],
        );
        let invoker = invoker(vec![flaky.clone() as Arc<dyn Backend>]);

        let results = invoker.extract(&transcript(), &[]).await;
        assert_eq!(results["flaky:model"].as_ref().unwrap().len(), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let big = Scripted::new("big:model", vec![Ok(format!("{{\"todos\": [\"{}\"]}}", "x".repeat(100)))]);
        let invoker = ExtractionInvoker::new(
            vec![big as Arc<dyn Backend>],
            Arc::new(KeywordSettings::default()),
            Limits {
                max_response_bytes: 50,
                ..Default::default()
            },
            fast_retry(),
        );

        let results = invoker.extract(&transcript(), &[]).await;
        assert!(matches!(results["big:model"], Err(BackendError::Malformed(_))));
    }

    #[test]
    fn test_prompt_contains_contexts_and_reference_date() {
        let t = transcript();
        let matcher = KeywordMatcher::new(&["TB".to_string()], 50, true);
        let matches: Vec<_> = matcher.matches(&t).collect();
        let prompt = build_prompt(&t, &matches, &KeywordSettings::default(), 100_000);

        assert!(prompt.contains("2025-01-20 (Monday)"));
        assert!(prompt.contains("1. [TB] remind me to buy milk"));
        assert!(prompt.contains("high: urgent"));
    }

    #[test]
    fn test_prompt_truncated() {
        let t = transcript();
        let prompt = build_prompt(&t, &[], &KeywordSettings::default(), 64);
        assert!(prompt.len() <= 64);
    }
}
