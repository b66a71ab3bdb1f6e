//! OpenAI-compatible `/chat/completions` backend
//!
//! Works against OpenRouter, OpenAI, vLLM and Ollama's compatible endpoint.

use crate::*;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, trace};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Chat completions backend
pub struct ChatCompletionsProvider {
    client: Client,
    api_key: String,
    api_base: String,
    default_model: String,
    timeout: Duration,
    is_openrouter: bool,
}

impl ChatCompletionsProvider {
    pub fn new(
        api_key: impl Into<String>,
        api_base: Option<String>,
        default_model: Option<String>,
    ) -> Self {
        let api_key = api_key.into();
        let is_openrouter = api_key.starts_with("sk-or-")
            || api_base
                .as_ref()
                .map(|b| b.contains("openrouter"))
                .unwrap_or(false);

        let api_base = api_base
            .unwrap_or_else(|| {
                if is_openrouter {
                    "https://openrouter.ai/api/v1".to_string()
                } else {
                    "https://api.openai.com/v1".to_string()
                }
            })
            .trim_end_matches('/')
            .to_string();

        let default_model = default_model.unwrap_or_else(|| {
            if is_openrouter {
                "anthropic/claude-sonnet-4".to_string()
            } else {
                "gpt-4o-mini".to_string()
            }
        });

        Self {
            client: Client::new(),
            api_key,
            api_base,
            default_model,
            timeout: DEFAULT_TIMEOUT,
            is_openrouter,
        }
    }

    /// Per-request HTTP timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn is_openrouter(&self) -> bool {
        self.is_openrouter
    }

    fn is_local(&self) -> bool {
        self.api_base.contains("://localhost") || self.api_base.contains("://127.0.0.1")
    }

    fn build_request(&self, request: &GenerateRequest) -> serde_json::Value {
        let model = request
            .options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let messages: Vec<serde_json::Value> = request
            .to_messages()
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": &m.content }))
            .collect();

        json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.options.max_tokens,
            "temperature": request.options.temperature,
        })
    }

    fn parse_response(&self, json: serde_json::Value) -> Result<String> {
        let choice = json["choices"]
            .get(0)
            .ok_or(ProviderError::InvalidResponse)?;

        choice["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or(ProviderError::InvalidResponse)
    }
}

#[async_trait]
impl Provider for ChatCompletionsProvider {
    async fn generate(&self, request: GenerateRequest) -> Result<String> {
        if !self.is_configured() {
            return Err(ProviderError::NoApiKey);
        }

        trace!("posting chat completion to {}", self.api_base);

        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_request(&request);

        let mut builder = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout)
            } else {
                ProviderError::from(e)
            }
        })?;

        let status = response.status();
        let json: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let error = json["error"]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string();
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited,
                502..=504 => ProviderError::Unavailable(error),
                _ => ProviderError::Api(error),
            });
        }

        debug!(
            "chat completion finished: {}",
            json["choices"][0]["finish_reason"]
                .as_str()
                .unwrap_or("unknown")
        );

        self.parse_response(json)
    }

    fn default_model(&self) -> String {
        self.default_model.clone()
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() || self.is_local()
    }
}
