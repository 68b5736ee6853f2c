//! Transcript sources: the Limitless lifelog API and local JSON files.
//!
//! Both accept the lifelog record shape (`id`, `startTime`, `markdown` or
//! `contents[]`, `title`) as well as the crate's own [`Transcript`] shape.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{send_json, TranscriptSource};
use crate::core::pipeline::{with_retry, RetryPolicy};
use crate::domain::Transcript;

pub const DEFAULT_BASE_URL: &str = "https://api.limitless.ai";

/// Records per page requested from the lifelog API
const PAGE_SIZE: u32 = 10;

/// Limitless lifelog API client
pub struct LimitlessClient {
    api_key: String,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl LimitlessClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Self {
            api_key,
            base_url,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Endpoint URL, tolerating a base that already ends in `/v1/lifelogs`
    fn endpoint(&self) -> String {
        if self.base_url.ends_with("/lifelogs") {
            self.base_url.clone()
        } else if self.base_url.ends_with("/v1") {
            format!("{}/lifelogs", self.base_url)
        } else {
            format!("{}/v1/lifelogs", self.base_url)
        }
    }

    async fn fetch_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<Value> {
        let mut query: Vec<(&str, String)> = vec![
            ("start", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("timezone", "UTC".to_string()),
            ("limit", PAGE_SIZE.to_string()),
            ("direction", "asc".to_string()),
            ("includeMarkdown", "true".to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let url = self.endpoint();
        with_retry(&self.retry, "limitless", || {
            let request = self
                .client
                .get(&url)
                .header("X-API-Key", &self.api_key)
                .query(&query);
            send_json(request, self.timeout)
        })
        .await
        .with_context(|| format!("Failed to fetch lifelogs from {}", url))
    }
}

#[async_trait]
impl TranscriptSource for LimitlessClient {
    fn name(&self) -> &str {
        "limitless"
    }

    async fn fetch(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Transcript>> {
        let mut transcripts = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;
            let body = self.fetch_page(start, end, cursor.as_deref()).await?;

            let records = body
                .pointer("/data/lifelogs")
                .and_then(|l| l.as_array())
                .cloned()
                .unwrap_or_default();

            debug!(page, records = records.len(), "Fetched lifelog page");

            for record in &records {
                match parse_transcript(record) {
                    Some(t) if seen.insert(t.id.clone()) => transcripts.push(t),
                    Some(t) => debug!(transcript = %t.id, "Duplicate lifelog across pages"),
                    None => warn!(record = %record, "Skipping lifelog without id or timestamp"),
                }
            }

            let next = body
                .pointer("/meta/lifelogs/nextCursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string);

            match next {
                Some(next) if !records.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }

        info!(count = transcripts.len(), pages = page, "Fetched transcripts");
        Ok(transcripts)
    }
}

/// Reads transcripts from a JSON file or a directory of `*.json` files.
///
/// A file may hold an array, an object with a `transcripts` array, or a
/// single transcript. The requested range is ignored: everything in the path
/// is returned, de-duplicated by id.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn files(&self) -> Result<Vec<PathBuf>> {
        if self.path.is_dir() {
            let pattern = self.path.join("*.json");
            let pattern = pattern.to_string_lossy();
            let mut files: Vec<PathBuf> = glob::glob(&pattern)
                .with_context(|| format!("Invalid transcript path: {}", self.path.display()))?
                .filter_map(|entry| entry.ok())
                .collect();
            files.sort();
            Ok(files)
        } else if self.path.is_file() {
            Ok(vec![self.path.clone()])
        } else {
            anyhow::bail!("Transcript path does not exist: {}", self.path.display())
        }
    }
}

async fn load_file(path: &Path) -> Result<Vec<Value>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read transcripts: {}", path.display()))?;
    let data: Value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid transcript JSON: {}", path.display()))?;

    Ok(match data {
        Value::Array(items) => items,
        Value::Object(ref map) => match map.get("transcripts").and_then(|t| t.as_array()) {
            Some(items) => items.clone(),
            None => vec![data],
        },
        _ => {
            warn!(path = %path.display(), "Unexpected transcript file format");
            Vec::new()
        }
    })
}

#[async_trait]
impl TranscriptSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<Transcript>> {
        let mut transcripts = Vec::new();
        let mut seen = HashSet::new();

        for file in self.files()? {
            for record in load_file(&file).await? {
                match parse_transcript(&record) {
                    Some(t) if seen.insert(t.id.clone()) => transcripts.push(t),
                    Some(_) => {}
                    None => warn!(path = %file.display(), "Skipping transcript without id or timestamp"),
                }
            }
        }

        info!(count = transcripts.len(), path = %self.path.display(), "Loaded transcripts");
        Ok(transcripts)
    }
}

/// Build a [`Transcript`] from a lifelog-like JSON record
pub fn parse_transcript(record: &Value) -> Option<Transcript> {
    let id = match record.get("id")? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    let timestamp = ["timestamp", "startTime", "start_time", "created_at"]
        .iter()
        .filter_map(|key| record.get(*key).and_then(|v| v.as_str()))
        .find_map(|s| DateTime::parse_from_rfc3339(s).ok())?
        .with_timezone(&Utc);

    let text = ["text", "markdown", "content"]
        .iter()
        .filter_map(|key| record.get(*key).and_then(|v| v.as_str()))
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
        .or_else(|| contents_text(record))
        .unwrap_or_default();

    let mut transcript = Transcript::new(id, timestamp, text);
    if let Some(title) = record.get("title").and_then(|t| t.as_str()) {
        transcript = transcript.with_title(title);
    }
    Some(transcript)
}

/// Join the `content` of each `contents[]` node
fn contents_text(record: &Value) -> Option<String> {
    let nodes = record.get("contents")?.as_array()?;
    let parts: Vec<&str> = nodes
        .iter()
        .filter_map(|n| match n {
            Value::String(s) => Some(s.as_str()),
            Value::Object(_) => n.get("content").and_then(|c| c.as_str()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}
