//! Anthropic messages API backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{send_json, Backend, BackendError, SYSTEM_PROMPT};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicBackend {
    id: String,
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(model: &str, api_key: String) -> Self {
        Self {
            id: format!("anthropic:{}", model),
            model: model.to_string(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": SYSTEM_PROMPT,
            "messages": [{ "role": "user", "content": prompt }],
        })
    }
}

/// Concatenate the text blocks of a messages response
fn extract_text(json: &Value) -> Result<String, BackendError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| BackendError::Malformed("missing content array".to_string()))?;

    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();

    if text.is_empty() {
        return Err(BackendError::Malformed("response has no text blocks".to_string()));
    }
    Ok(text)
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError> {
        let request = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(prompt));

        let json = send_json(request, timeout).await?;
        extract_text(&json)
    }
}
