//! Text completion providers
//!
//! The agent loop only ever talks to the [`Provider`] trait; concrete
//! backends live in submodules.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use thiserror::Error;

pub mod chat_completions;

pub use chat_completions::ChatCompletionsProvider;

/// Provider errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider rejected request: {0}")]
    Api(String),

    #[error("provider has no api key")]
    NoApiKey,

    #[error("provider returned an invalid response")]
    InvalidResponse,

    #[error("provider rate limited")]
    RateLimited,

    #[error("provider response decode error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    /// Whether a retry of the same request could reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::Timeout(_) | ProviderError::RateLimited
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else if err.is_connect() || err.is_request() {
            ProviderError::Unavailable(err.to_string())
        } else if err.is_decode() {
            ProviderError::InvalidResponse
        } else {
            ProviderError::Api(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Speaker of a history message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One history entry handed to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling options
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    /// Backend model override; `None` uses the provider default
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Input to [`Provider::generate`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub history: Vec<Message>,
    pub options: GenerateOptions,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    /// Flatten into an ordered message list: system, history, then the prompt
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(Message::user(self.prompt.clone()));
        messages
    }
}

/// Text completion capability
#[async_trait]
pub trait Provider: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<String>;
    fn default_model(&self) -> String;
    fn is_configured(&self) -> bool;
}
