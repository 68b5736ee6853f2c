//! Google Gemini generateContent backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{send_json, Backend, BackendError, SYSTEM_PROMPT};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiBackend {
    id: String,
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(model: &str, api_key: String) -> Self {
        Self {
            id: format!("gemini:{}", model),
            model: model.to_string(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_PROMPT }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseMimeType": "application/json" },
        })
    }
}

fn extract_text(json: &Value) -> Result<String, BackendError> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| BackendError::Malformed("missing candidates[0].content.parts".to_string()))?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();

    if text.is_empty() {
        return Err(BackendError::Malformed("candidate has no text parts".to_string()));
    }
    Ok(text)
}

#[async_trait]
impl Backend for GeminiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError> {
        let request = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(prompt));

        let json = send_json(request, timeout).await?;
        extract_text(&json)
    }
}
