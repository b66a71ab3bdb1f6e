//! Context builder for assembling agent prompts

use chrono::Local;
use genesis_config::{Config, PersonaConfig};
use genesis_plugins::ActionSpec;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Sent back to the model after a response it could not be understood.
pub const FORMAT_REMINDER: &str = "Your last response could not be understood. Reply with exactly one JSON object and nothing else: \
either {\"thought\": \"...\", \"action\": \"<action name>\", \"params\": {...}} to run an action, \
or {\"thought\": \"...\", \"final_answer\": \"...\"} to answer.";

/// Output of a pre-request action, injected as context data
#[derive(Debug, Clone, PartialEq)]
pub struct ContextData {
    pub action: String,
    pub payload: Map<String, Value>,
}

/// Builds the system prompt for each reasoning step
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    persona: PersonaConfig,
}

impl ContextBuilder {
    pub fn new(persona: PersonaConfig) -> Self {
        Self { persona }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.persona.clone())
    }

    /// Persona, response format, available actions and context data
    pub fn build_system_prompt(&self, actions: &[Arc<ActionSpec>], data: &[ContextData]) -> String {
        let mut parts = vec![self.identity(), Self::response_format()];
        parts.push(format!("# Available actions\n\n{}", Self::describe_actions(actions)));

        if !data.is_empty() {
            let blocks: Vec<String> = data
                .iter()
                .map(|d| {
                    let payload = serde_json::to_string_pretty(&d.payload)
                        .unwrap_or_else(|_| Value::Object(d.payload.clone()).to_string());
                    format!("### {}\n{}", d.action, payload)
                })
                .collect();
            parts.push(format!("# Context data\n\n{}", blocks.join("\n\n")));
        }

        parts.join("\n\n---\n\n")
    }

    fn identity(&self) -> String {
        let now = Local::now().format("%Y-%m-%d %H:%M (%A)");
        let mut text = format!(
            "# {}\n\nYou are {}, an assistant that completes tasks by reasoning step by step and running actions.\n\n## Current Time\n{}",
            self.persona.name, self.persona.name, now
        );
        if !self.persona.personality.trim().is_empty() {
            text.push_str("\n\n## Personality\n");
            text.push_str(self.persona.personality.trim());
        }
        text
    }

    fn response_format() -> String {
        r#"# Response format

Reply with exactly one JSON object per turn and nothing else.

To run an action:
{"thought": "why this action helps", "action": "<action name>", "params": {"<name>": <value>}}

When you can answer the user:
{"thought": "how you know", "final_answer": "<answer for the user>"}

After each action you receive a message starting with "Observation:" holding its result.
Never invent observations and never run more than one action per reply."#
            .to_string()
    }

    /// Model-facing action list. Pre-request actions run on their own and
    /// are left out.
    pub fn describe_actions(actions: &[Arc<ActionSpec>]) -> String {
        let mut text = String::new();
        for action in actions.iter().filter(|a| !a.is_pre_request()) {
            text.push_str(&format!("- **{}**: {}\n", action.name, action.description));
            if action.parameters.is_empty() {
                text.push_str("  Parameters: None\n");
            } else {
                let params: Vec<String> = action
                    .parameters
                    .iter()
                    .map(|(name, spec)| format!("\"{}\": <{}>", name, spec.summary()))
                    .collect();
                text.push_str(&format!("  Parameters: {{{}}}\n", params.join(", ")));
            }
        }

        if text.is_empty() {
            "No actions currently available.".to_string()
        } else {
            text.trim_end().to_string()
        }
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(PersonaConfig::default())
    }
}
