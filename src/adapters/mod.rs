//! Adapter interfaces for external systems.
//!
//! Three seams, each a trait so the pipeline can be driven by in-memory
//! doubles in tests:
//! - [`Backend`]: an LLM that turns a prompt into raw text
//! - [`TranscriptSource`]: where transcripts come from
//! - [`RecordSink`]: the structured database items are upserted into

pub mod anthropic;
pub mod archive;
pub mod fabric;
pub mod gemini;
pub mod limitless;
pub mod notion;
pub mod openai;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ApiKeys;
use crate::domain::{ExternalRecord, Transcript};

pub use anthropic::AnthropicBackend;
pub use archive::{ArchivingSource, TranscriptArchive};
pub use fabric::FabricBackend;
pub use gemini::GeminiBackend;
pub use limitless::{FileSource, LimitlessClient};
pub use notion::{DryRunSink, NotionClient, CALLS_PER_UPSERT};
pub use openai::OpenAiBackend;

/// System instruction shared by every chat-style backend
pub const SYSTEM_PROMPT: &str = "You extract actionable projects, tasks and todo items from \
voice transcripts. Respond with a single JSON object and nothing else.";

/// Failure of a single backend call.
///
/// Variants are split by whether a retry can help; see [`BackendError::is_transient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Whether the call may succeed if repeated
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_) | BackendError::RateLimited { .. } | BackendError::Transient(_)
        )
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, body: &str, headers: &HeaderMap) -> Self {
        let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
        match status.as_u16() {
            429 => BackendError::RateLimited {
                retry_after: retry_after(headers),
            },
            401 | 403 => BackendError::Auth(detail),
            408 => BackendError::Transient(detail),
            s if s >= 500 => BackendError::Transient(detail),
            _ => BackendError::InvalidRequest(detail),
        }
    }

    /// Classify a transport-level error
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(timeout)
        } else if err.is_decode() {
            BackendError::Malformed(err.to_string())
        } else if err.is_builder() {
            BackendError::InvalidRequest(err.to_string())
        } else {
            BackendError::Transient(err.to_string())
        }
    }
}

/// Parse a `Retry-After` header given in seconds
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Send a JSON request and return the decoded JSON body, classifying failures
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<serde_json::Value, BackendError> {
    let response = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| BackendError::from_reqwest(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::from_status(status, &body, &headers));
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| BackendError::from_reqwest(e, timeout))
}

/// An LLM backend: prompt in, raw text out
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identifier, e.g. `openai:gpt-4o-mini`
    fn id(&self) -> &str;

    /// Send one prompt and return the raw response text
    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError>;
}

/// Source of transcripts for a date range
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    fn name(&self) -> &str;

    /// Complete, duplicate-free list of transcripts in `[start, end)`
    async fn fetch(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Transcript>>;
}

/// The external structured database
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    /// Create or update the record keyed by its canonical id; returns the external id
    async fn upsert(&self, record: &ExternalRecord) -> Result<String>;
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    Fabric,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Fabric => "fabric",
        }
    }
}

/// A parsed `provider:model` backend identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub provider: Provider,
    pub model: String,
}

impl BackendSpec {
    /// Parse `openai:gpt-4o`, `a:claude-3-7-sonnet-20250219`, `fabric:extract_wisdom`, ...
    pub fn parse(spec: &str) -> Result<Self> {
        let (prefix, model) = spec
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Backend '{}' must look like provider:model", spec))?;

        let provider = match prefix.trim().to_lowercase().as_str() {
            "openai" | "o" => Provider::OpenAi,
            "anthropic" | "a" => Provider::Anthropic,
            "gemini" | "g" => Provider::Gemini,
            "fabric" | "f" => Provider::Fabric,
            other => anyhow::bail!("Unknown backend provider '{}' in '{}'", other, spec),
        };

        let model = model.trim();
        if model.is_empty() {
            anyhow::bail!("Backend '{}' has an empty model name", spec);
        }

        Ok(Self {
            provider,
            model: model.to_string(),
        })
    }

    /// Canonical identifier (aliases expanded)
    pub fn id(&self) -> String {
        format!("{}:{}", self.provider.as_str(), self.model)
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Name of the environment variable a spec needs but lacks, if any
pub fn missing_credential(spec: &BackendSpec, keys: &ApiKeys) -> Option<&'static str> {
    let (key, var) = match spec.provider {
        Provider::OpenAi => (&keys.openai, "OPENAI_API_KEY"),
        Provider::Anthropic => (&keys.anthropic, "ANTHROPIC_API_KEY"),
        Provider::Gemini => (&keys.gemini, "GEMINI_API_KEY"),
        Provider::Fabric => return None,
    };
    match key {
        Some(k) if !k.trim().is_empty() => None,
        _ => Some(var),
    }
}

/// Construct a backend for a spec, failing if its credentials are missing
pub fn build_backend(spec: &BackendSpec, keys: &ApiKeys) -> Result<Arc<dyn Backend>> {
    if let Some(var) = missing_credential(spec, keys) {
        anyhow::bail!("{} is required for backend '{}'", var, spec);
    }
    let key = |k: &Option<String>| k.clone().unwrap_or_default();

    let backend: Arc<dyn Backend> = match spec.provider {
        Provider::OpenAi => Arc::new(OpenAiBackend::new(&spec.model, key(&keys.openai))),
        Provider::Anthropic => Arc::new(AnthropicBackend::new(&spec.model, key(&keys.anthropic))),
        Provider::Gemini => Arc::new(GeminiBackend::new(&spec.model, key(&keys.gemini))),
        Provider::Fabric => Arc::new(FabricBackend::new(&spec.model)),
    };

    Ok(backend)
}
