//! In-memory doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use lifelog_sync::adapters::{Backend, BackendError, RecordSink, TranscriptSource};
use lifelog_sync::config::KeywordSettings;
use lifelog_sync::core::{
    BatchWindow, ExtractionInvoker, ItemTransformer, KeywordMatcher, Limits, Orchestrator,
    RetryPolicy, TranscriptPipeline,
};
use lifelog_sync::domain::{ExternalRecord, Transcript};

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap()
}

pub fn window() -> BatchWindow {
    BatchWindow::new(at(20, 0), at(21, 0)).unwrap()
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    }
}

/// Source returning a fixed batch and counting fetches
pub struct MemorySource {
    pub transcripts: Vec<Transcript>,
    pub fetches: AtomicU32,
}

impl MemorySource {
    pub fn new(transcripts: Vec<Transcript>) -> Arc<Self> {
        Arc::new(Self {
            transcripts,
            fetches: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl TranscriptSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<Transcript>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.transcripts.clone())
    }
}

/// Source that honours the requested range, like the lifelog API
pub struct WindowedSource {
    pub transcripts: Vec<Transcript>,
}

impl WindowedSource {
    pub fn new(transcripts: Vec<Transcript>) -> Arc<Self> {
        Arc::new(Self { transcripts })
    }
}

#[async_trait]
impl TranscriptSource for WindowedSource {
    fn name(&self) -> &str {
        "windowed"
    }

    async fn fetch(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Transcript>> {
        Ok(self
            .transcripts
            .iter()
            .filter(|t| t.timestamp >= start && t.timestamp < end)
            .cloned()
            .collect())
    }
}

/// Backend answering per transcript by looking for a marker in the prompt
pub struct ScriptedBackend {
    pub id: String,
    /// (substring of the prompt, response)
    pub script: Vec<(String, Result<String, BackendError>)>,
    pub fallback: Result<String, BackendError>,
    /// Prompts received, in call order
    pub prompts: Mutex<Vec<String>>,
    pub delay: Duration,
    /// Only prompts containing this marker are delayed
    pub delay_marker: Option<String>,
}

impl ScriptedBackend {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Vec::new(),
            fallback: Ok(r#"{"items": []}"#.to_string()),
            prompts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            delay_marker: None,
        }
    }

    pub fn on(mut self, marker: &str, response: &str) -> Self {
        self.script.push((marker.to_string(), Ok(response.to_string())));
        self
    }

    pub fn failing(mut self, error: BackendError) -> Self {
        self.fallback = Err(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_delay_on(mut self, marker: &str, delay: Duration) -> Self {
        self.delay = delay;
        self.delay_marker = Some(marker.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, prompt: &str, _timeout: Duration) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let delayed = match &self.delay_marker {
            Some(marker) => prompt.contains(marker.as_str()),
            None => true,
        };
        if delayed && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .iter()
            .find(|(marker, _)| prompt.contains(marker.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Sink keyed by canonical id, like a database with a unique column
#[derive(Default)]
pub struct MemorySink {
    pub records: Mutex<BTreeMap<String, ExternalRecord>>,
    pub upserts: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn titles(&self) -> Vec<String> {
        let mut titles: Vec<String> = self
            .records
            .lock()
            .unwrap()
            .values()
            .map(|r| r.title.clone())
            .collect();
        titles.sort();
        titles
    }

    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .records
            .lock()
            .unwrap()
            .values()
            .map(|r| r.source_transcript_id.clone())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, record: &ExternalRecord) -> Result<String> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .unwrap()
            .insert(record.canonical_id.clone(), record.clone());
        Ok(format!("page-{}", &record.canonical_id[..12]))
    }
}

pub fn orchestrator(
    source: Arc<dyn TranscriptSource>,
    backends: Vec<Arc<dyn Backend>>,
    sink: Arc<dyn RecordSink>,
    limits: Limits,
) -> Orchestrator {
    let keywords = Arc::new(KeywordSettings::default());
    let invoker = ExtractionInvoker::new(backends, Arc::clone(&keywords), limits.clone(), fast_retry());
    let pipeline = TranscriptPipeline::new(
        KeywordMatcher::from_settings(&keywords),
        invoker,
        ItemTransformer::new(keywords),
        sink,
        fast_retry().budget(limits.request_timeout()),
    );
    Orchestrator::new(source, pipeline, limits)
}
