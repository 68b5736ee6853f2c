//! OpenAI chat completions backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{send_json, Backend, BackendError, SYSTEM_PROMPT};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiBackend {
    id: String,
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(model: &str, api_key: String) -> Self {
        Self {
            id: format!("openai:{}", model),
            model: model.to_string(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point at a compatible endpoint instead of api.openai.com
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request_body(&self, prompt: &str) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
            "response_format": { "type": "json_object" },
        });
        // Reasoning models reject a temperature override
        if !self.model.starts_with('o') {
            body["temperature"] = json!(0.2);
        }
        body
    }
}

/// Pull `choices[0].message.content` out of a completion response
fn extract_content(json: &Value) -> Result<String, BackendError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| BackendError::Malformed("missing choices[0].message.content".to_string()))
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError> {
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt));

        let json = send_json(request, timeout).await?;
        extract_content(&json)
    }
}
