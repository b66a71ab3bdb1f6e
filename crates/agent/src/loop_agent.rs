//! Agent loop - Thought / Action / Observation cycle
//!
//! Each invocation starts in Reasoning: the model is asked for the next
//! step, and the reply either finishes the run or names one action. The
//! action runs, its result becomes an Observation, and reasoning resumes.
//! Every run is bounded by a step budget, a wall-clock deadline and the
//! caller's cancellation token.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use genesis_config::Config;
use genesis_plugins::{
    ActionExecutor, ActionOutcome, ActionRequest, ActionResult, ExecutorError, PluginRegistry,
    RegistryError, RunError, Scope,
};
use genesis_provider::{GenerateOptions, GenerateRequest, Message, Provider, ProviderError, Role};
use genesis_session::SessionManager;

use crate::context::{ContextBuilder, ContextData, FORMAT_REMINDER};
use crate::conversation::{ConversationState, TurnKind};
use crate::parse::{parse_response, ActionCall, ParsedResponse};

/// Used as the deadline when the wall-clock limit does not fit an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Limits for one invocation
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Reasoning/Acting round trips before giving up
    pub max_steps: u32,
    /// Corrective retries after an unparsable reply; one more failure aborts
    pub max_parse_retries: u32,
    /// Consecutive infra or provider failures that abort the run
    pub max_consecutive_infra_errors: u32,
    pub provider_timeout: Duration,
    pub action_timeout: Duration,
    pub max_wall_clock: Duration,
    pub max_history_messages: usize,
    pub generate: GenerateOptions,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        let defaults = &config.agent.defaults;
        Self {
            max_steps: defaults.max_steps,
            max_parse_retries: defaults.max_parse_retries,
            max_consecutive_infra_errors: defaults.max_consecutive_infra_errors,
            provider_timeout: config.provider_timeout(),
            action_timeout: config.action_timeout(),
            max_wall_clock: config.max_wall_clock(),
            max_history_messages: defaults.max_history_messages,
            generate: GenerateOptions {
                model: Some(config.default_model()),
                max_tokens: config.provider.max_tokens,
                temperature: config.provider.temperature,
            },
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a run ended without an answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    StepBudgetExceeded { steps: u32 },
    ReasoningUnparsable { attempts: u32, reason: String },
    Provider(String),
    RepeatedInfraError(String),
    DeadlineExceeded(Duration),
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::StepBudgetExceeded { steps } => {
                write!(f, "step budget of {} exhausted", steps)
            }
            AbortReason::ReasoningUnparsable { attempts, reason } => write!(
                f,
                "the model gave {} unusable responses in a row ({})",
                attempts, reason
            ),
            AbortReason::Provider(e) => write!(f, "the model provider kept failing: {}", e),
            AbortReason::RepeatedInfraError(e) => {
                write!(f, "actions kept failing to run: {}", e)
            }
            AbortReason::DeadlineExceeded(limit) => {
                write!(f, "time limit of {}s reached", limit.as_secs())
            }
            AbortReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal state of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Done { answer: String },
    Aborted { reason: AbortReason },
}

impl LoopOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, LoopOutcome::Done { .. })
    }

    /// Text shown to the user. An aborted run never reads as a success.
    pub fn user_message(&self) -> String {
        match self {
            LoopOutcome::Done { answer } => answer.clone(),
            LoopOutcome::Aborted { reason } => {
                format!("I could not complete the task: {}.", reason)
            }
        }
    }
}

/// Result of one invocation, with its full audit trail
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub run_id: Uuid,
    pub outcome: LoopOutcome,
    /// Round trips that reached the Acting state
    pub steps: u32,
    pub state: ConversationState,
}

/// Bookkeeping for one invocation
pub struct LoopContext {
    pub run_id: Uuid,
    pub scope: Scope,
    pub state: ConversationState,
    pub steps: u32,
    pub budget: u32,
    pub cancel: CancellationToken,
    started: Instant,
    deadline: Instant,
    parse_failures: u32,
    infra_failures: u32,
    provider_failures: u32,
}

impl LoopContext {
    pub fn new(
        scope: Scope,
        state: ConversationState,
        settings: &AgentSettings,
        cancel: CancellationToken,
    ) -> Self {
        let started = Instant::now();
        Self {
            run_id: Uuid::new_v4(),
            scope,
            state,
            steps: 0,
            budget: settings.max_steps,
            cancel,
            started,
            deadline: started
                .checked_add(settings.max_wall_clock)
                .unwrap_or_else(|| started + FAR_FUTURE),
            parse_failures: 0,
            infra_failures: 0,
            provider_failures: 0,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn finish(self, outcome: LoopOutcome) -> LoopResult {
        LoopResult {
            run_id: self.run_id,
            outcome,
            steps: self.steps,
            state: self.state,
        }
    }
}

enum Step {
    Continue,
    Finish(LoopOutcome),
}

fn aborted(reason: AbortReason) -> Step {
    Step::Finish(LoopOutcome::Aborted { reason })
}

/// The agent loop drives one task per `run` call; runs share nothing but
/// the registry and executor.
pub struct AgentLoop<P: Provider> {
    provider: Arc<P>,
    registry: Arc<PluginRegistry>,
    executor: Arc<ActionExecutor>,
    context: ContextBuilder,
    settings: AgentSettings,
    sessions: Option<Arc<Mutex<SessionManager>>>,
}

impl<P: Provider> AgentLoop<P> {
    pub fn new(
        provider: P,
        registry: Arc<PluginRegistry>,
        executor: Arc<ActionExecutor>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            registry,
            executor,
            context: ContextBuilder::default(),
            settings,
            sessions: None,
        }
    }

    pub fn with_context_builder(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    /// Persist history through `sessions` in [`AgentLoop::process`]
    pub fn with_sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = Some(Arc::new(Mutex::new(sessions)));
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    /// Run `task` with stored history for `session_key`, then store the
    /// task and its outcome.
    pub async fn process(
        &self,
        scope: &Scope,
        session_key: &str,
        task: &str,
        cancel: CancellationToken,
    ) -> LoopResult {
        let history = match &self.sessions {
            Some(sessions) => {
                let mut sessions = sessions.lock().await;
                sessions
                    .get_or_create(session_key)
                    .await
                    .get_history(self.settings.max_history_messages)
            }
            None => Vec::new(),
        };

        let result = self.run(scope, task, history, cancel).await;

        if let Some(sessions) = &self.sessions {
            let mut sessions = sessions.lock().await;
            let mut session = sessions.get_or_create(session_key).await.clone();
            session.add_message(Role::User, task);

            let mut extra = HashMap::new();
            extra.insert("run_id".to_string(), json!(result.run_id.to_string()));
            extra.insert("steps".to_string(), json!(result.steps));
            if let LoopOutcome::Aborted { reason } = &result.outcome {
                extra.insert("aborted".to_string(), json!(reason.to_string()));
            }
            session.add_message_with(Role::Assistant, result.outcome.user_message(), extra);

            if let Err(e) = sessions.save(&session).await {
                warn!(session = %session_key, error = %e, "failed to save session");
            }
        }

        result
    }

    /// Drive one task to `Done` or `Aborted`.
    pub async fn run(
        &self,
        scope: &Scope,
        task: &str,
        history: Vec<Message>,
        cancel: CancellationToken,
    ) -> LoopResult {
        let mut state = ConversationState::from_history(history);
        state.push_user(task);
        let mut ctx = LoopContext::new(scope.clone(), state, &self.settings, cancel);

        info!(run_id = %ctx.run_id, scope = %scope, budget = ctx.budget, "agent run started");

        let data = match self.run_pre_request(&ctx).await {
            Ok(data) => data,
            Err(reason) => return self.conclude(ctx, LoopOutcome::Aborted { reason }),
        };

        loop {
            let step = self.reason(&mut ctx, &data).await;
            if let Step::Finish(outcome) = step {
                return self.conclude(ctx, outcome);
            }
        }
    }

    fn conclude(&self, ctx: LoopContext, outcome: LoopOutcome) -> LoopResult {
        let elapsed_ms = ctx.started.elapsed().as_millis() as u64;
        match &outcome {
            LoopOutcome::Done { .. } => {
                info!(run_id = %ctx.run_id, steps = ctx.steps, elapsed_ms, "agent run done")
            }
            LoopOutcome::Aborted { reason } => {
                warn!(run_id = %ctx.run_id, steps = ctx.steps, elapsed_ms, reason = %reason, "agent run aborted")
            }
        }
        ctx.finish(outcome)
    }

    /// Run every pre-request action visible to the caller, once.
    async fn run_pre_request(&self, ctx: &LoopContext) -> Result<Vec<ContextData>, AbortReason> {
        let mut data = Vec::new();
        let actions = self.registry.catalog_for(&ctx.scope);
        for action in actions.iter().filter(|a| a.is_pre_request()) {
            let timeout = self.settings.action_timeout.min(ctx.remaining());
            match self
                .executor
                .execute(action, &ctx.scope, &json!({}), timeout, &ctx.cancel)
                .await
            {
                Ok(ActionResult {
                    outcome: ActionOutcome::Success { payload },
                    ..
                }) => {
                    debug!(action = %action.name, "pre-request context collected");
                    data.push(ContextData {
                        action: action.name.clone(),
                        payload,
                    });
                }
                Ok(result) => {
                    warn!(action = %action.name, outcome = ?result.outcome, "pre-request action failed")
                }
                Err(ExecutorError::Cancelled) => return Err(AbortReason::Cancelled),
                Err(e) => warn!(action = %action.name, error = %e, "pre-request action rejected"),
            }
        }
        Ok(data)
    }

    async fn reason(&self, ctx: &mut LoopContext, data: &[ContextData]) -> Step {
        if ctx.cancel.is_cancelled() {
            return aborted(AbortReason::Cancelled);
        }
        if ctx.remaining().is_zero() {
            return aborted(AbortReason::DeadlineExceeded(self.settings.max_wall_clock));
        }
        if ctx.steps >= ctx.budget {
            return aborted(AbortReason::StepBudgetExceeded { steps: ctx.steps });
        }

        let request = self.build_request(ctx, data);
        let limit = self.settings.provider_timeout.min(ctx.remaining());
        debug!(scope = %ctx.scope, step = ctx.steps + 1, "calling provider");

        let reply = tokio::select! {
            _ = ctx.cancel.cancelled() => return aborted(AbortReason::Cancelled),
            reply = tokio::time::timeout(limit, self.provider.generate(request)) => {
                reply.unwrap_or(Err(ProviderError::Timeout(limit)))
            }
        };

        let text = match reply {
            Ok(text) => {
                ctx.provider_failures = 0;
                text
            }
            Err(e) => {
                ctx.provider_failures += 1;
                error!(
                    scope = %ctx.scope,
                    error = %e,
                    failures = ctx.provider_failures,
                    "provider call failed"
                );
                if ctx.provider_failures >= self.settings.max_consecutive_infra_errors
                    || !e.is_transient()
                {
                    return aborted(AbortReason::Provider(e.to_string()));
                }
                return Step::Continue;
            }
        };

        ctx.state.push_assistant(text.clone());

        match parse_response(&text) {
            ParsedResponse::Unparsable { reason } => {
                ctx.parse_failures += 1;
                warn!(
                    scope = %ctx.scope,
                    failures = ctx.parse_failures,
                    reason = %reason,
                    "unparsable model response"
                );
                if ctx.parse_failures > self.settings.max_parse_retries {
                    return aborted(AbortReason::ReasoningUnparsable {
                        attempts: ctx.parse_failures,
                        reason,
                    });
                }
                ctx.state
                    .push_observation(format!("{} ({})", FORMAT_REMINDER, reason));
                Step::Continue
            }
            ParsedResponse::FinalAnswer { thought, answer } => {
                ctx.parse_failures = 0;
                if let Some(thought) = thought {
                    ctx.state.push(TurnKind::Thought, thought);
                }
                ctx.state.push(TurnKind::FinalAnswer, answer.clone());
                Step::Finish(LoopOutcome::Done { answer })
            }
            ParsedResponse::ActionCall { thought, call } => {
                ctx.parse_failures = 0;
                if let Some(thought) = thought {
                    ctx.state.push(TurnKind::Thought, thought);
                }
                ctx.state.push(
                    TurnKind::Action,
                    json!({"name": call.name, "arguments": call.arguments}).to_string(),
                );
                ctx.steps += 1;
                self.act(ctx, call).await
            }
        }
    }

    async fn act(&self, ctx: &mut LoopContext, call: ActionCall) -> Step {
        let request = ActionRequest::new(call.name, ctx.scope.clone(), call.arguments);
        let timeout = self.settings.action_timeout.min(ctx.remaining());
        info!(scope = %ctx.scope, action = %request.name, step = ctx.steps, "running action");

        // Pre-request actions feed the prompt; the model may not call them.
        let result = match self.registry.resolve(&request.scope, &request.name) {
            Ok(action) if action.is_pre_request() => Err(RunError::Registry(
                RegistryError::ActionNotFound(request.name.clone()),
            )),
            Ok(action) => self
                .executor
                .execute(&action, &request.scope, &request.arguments, timeout, &ctx.cancel)
                .await
                .map_err(RunError::from),
            Err(e) => Err(RunError::from(e)),
        };

        let observation = match result {
            Ok(result) => {
                if let ActionOutcome::InfraError { .. } = result.outcome {
                    ctx.infra_failures += 1;
                    if ctx.infra_failures >= self.settings.max_consecutive_infra_errors {
                        return aborted(AbortReason::RepeatedInfraError(describe_result(
                            &request.name,
                            &result,
                        )));
                    }
                } else {
                    ctx.infra_failures = 0;
                }
                describe_result(&request.name, &result)
            }
            Err(RunError::Executor(ExecutorError::Cancelled)) => {
                return aborted(AbortReason::Cancelled);
            }
            Err(RunError::Executor(ExecutorError::ArgumentInvalid { field, reason })) => format!(
                "action '{}' failed: invalid argument '{}': {}",
                request.name, field, reason
            ),
            Err(RunError::Registry(RegistryError::ActionNotFound(name))) => {
                debug!(scope = %ctx.scope, action = %name, "model asked for an unknown action");
                format!(
                    "action '{}' failed: no such action is available; use one from the list",
                    name
                )
            }
            Err(RunError::Registry(e)) => {
                format!("action '{}' failed: {}", request.name, e)
            }
        };

        ctx.state.push_observation(observation);
        Step::Continue
    }

    fn build_request(&self, ctx: &LoopContext, data: &[ContextData]) -> GenerateRequest {
        let catalog = self.registry.catalog_for(&ctx.scope);
        let system_prompt = self.context.build_system_prompt(&catalog, data);

        let mut messages = ctx.state.to_messages();
        let prompt = messages.pop().map(|m| m.content).unwrap_or_default();

        GenerateRequest::new(prompt)
            .with_system_prompt(system_prompt)
            .with_history(messages)
            .with_options(self.settings.generate.clone())
    }
}

/// Observation text for an action result
pub fn describe_result(action: &str, result: &ActionResult) -> String {
    match &result.outcome {
        ActionOutcome::Success { payload } => format!(
            "action '{}' succeeded: {}",
            action,
            Value::Object(payload.clone())
        ),
        ActionOutcome::Failure { message } => format!("action '{}' failed: {}", action, message),
        ActionOutcome::InfraError { kind, detail } => {
            format!("action '{}' could not run ({}): {}", action, kind, detail)
        }
    }
}
