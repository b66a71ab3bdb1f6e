//! Agent core: conversation state, response parsing, prompt assembly and
//! the reasoning loop that drives plugin actions.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

pub mod context;
pub mod conversation;
pub mod loop_agent;
pub mod parse;

pub use context::{ContextBuilder, ContextData};
pub use conversation::{ConversationState, Turn, TurnKind};
pub use loop_agent::{
    describe_result, AbortReason, AgentLoop, AgentSettings, LoopContext, LoopOutcome, LoopResult,
};
pub use parse::{parse_response, ActionCall, ParsedResponse};

use genesis_config::{paths, Config};
use genesis_plugins::{ActionExecutor, PluginRegistry, RegistryError};
use genesis_provider::{ChatCompletionsProvider, Provider, ProviderError};
use genesis_session::SessionManager;

/// Agent setup errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("plugin error: {0}")]
    Registry(#[from] RegistryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Build the configured completion backend.
///
/// A remote backend without an api key is rejected here rather than on the
/// first request.
pub fn provider_from_config(config: &Config) -> Result<ChatCompletionsProvider> {
    let provider = ChatCompletionsProvider::new(
        config.api_key().unwrap_or_default(),
        config.provider.api_base.clone(),
        Some(config.default_model()),
    )
    .with_timeout(config.provider_timeout());

    if !provider.is_configured() {
        return Err(AgentError::Provider(ProviderError::NoApiKey));
    }
    Ok(provider)
}

/// Wire up a ready agent from `config`: discover plugins in every scope,
/// start an executor and attach session storage.
pub async fn build_agent<P: Provider>(config: &Config, provider: P) -> Result<AgentLoop<P>> {
    let registry = Arc::new(PluginRegistry::from_config(config));
    for (scope, report) in registry.discover().await? {
        for rejected in &report.rejected {
            warn!(
                scope = %scope,
                path = %rejected.path.display(),
                reason = %rejected.reason,
                "plugin not loaded"
            );
        }
    }

    let sessions_dir = paths::sessions_dir();
    paths::ensure_dir(&sessions_dir).await?;
    let settings = AgentSettings::from_config(config);
    let sessions = SessionManager::with_max_messages(sessions_dir, settings.max_history_messages * 2);

    let executor = Arc::new(ActionExecutor::from_config(config));
    Ok(AgentLoop::new(provider, registry, executor, settings)
        .with_context_builder(ContextBuilder::from_config(config))
        .with_sessions(sessions))
}
