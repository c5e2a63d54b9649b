use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ModelError, ModelErrorKind, Result, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct ModelMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ModelMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageOut,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

/// Generic OpenAI-compatible-chat HTTP client. Per-provider pricing is
/// supplied by the caller (`cost_per_1k_tokens`) since the provider SDK
/// internals are explicitly out of scope (spec §1 Non-goals).
pub struct HttpModelClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    cost_per_1k_tokens: f64,
}

impl HttpModelClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, cost_per_1k_tokens: f64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            cost_per_1k_tokens,
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_millis(request.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let kind = if status.as_u16() == 429 {
                ModelErrorKind::RateLimited
            } else if status.is_client_error() {
                ModelErrorKind::ClientError
            } else {
                ModelErrorKind::ServerError
            };
            let body_text = response.text().await.unwrap_or_default();
            return Err(StoreError::Model(ModelError::new(kind, body_text)));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Model(ModelError::new(ModelErrorKind::Other, e.to_string())))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        let tokens_used = parsed.usage.unwrap_or_default().total_tokens;
        let cost_usd = (tokens_used as f64 / 1000.0) * self.cost_per_1k_tokens;

        Ok(ModelResponse { text, tokens_used, cost_usd })
    }
}

fn classify_transport_error(e: &reqwest::Error) -> StoreError {
    let kind = if e.is_timeout() {
        ModelErrorKind::Timeout
    } else {
        ModelErrorKind::Other
    };
    StoreError::Model(ModelError::new(kind, e.to_string()))
}
