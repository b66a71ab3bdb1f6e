//! Append-only record of one agent invocation

use genesis_provider::{Message, Role};
use serde::{Deserialize, Serialize};

/// Prefix marking tool output in provider-facing history
pub const OBSERVATION_PREFIX: &str = "Observation: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// A message from the person being served
    User,
    /// Raw model output, exactly as returned
    Assistant,
    Thought,
    /// The parsed action call, as compact JSON
    Action,
    Observation,
    FinalAnswer,
}

impl TurnKind {
    /// Thought, Action and FinalAnswer restate what the model already said
    /// in its Assistant turn, so they are kept for audit only.
    pub fn is_audit_only(&self) -> bool {
        matches!(self, TurnKind::Thought | TurnKind::Action | TurnKind::FinalAnswer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub kind: TurnKind,
    pub content: String,
}

/// Ordered turns of a conversation. Turns are only ever appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from stored history; system messages are dropped since the
    /// system prompt is rebuilt for every request.
    pub fn from_history(history: impl IntoIterator<Item = Message>) -> Self {
        let mut state = Self::new();
        for message in history {
            match message.role {
                Role::User => state.push(TurnKind::User, message.content),
                Role::Assistant => state.push(TurnKind::Assistant, message.content),
                Role::System => {}
            }
        }
        state
    }

    pub fn push(&mut self, kind: TurnKind, content: impl Into<String>) {
        self.turns.push(Turn {
            kind,
            content: content.into(),
        });
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(TurnKind::User, content);
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(TurnKind::Assistant, content);
    }

    pub fn push_observation(&mut self, content: impl Into<String>) {
        self.push(TurnKind::Observation, content);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn count(&self, kind: TurnKind) -> usize {
        self.turns.iter().filter(|t| t.kind == kind).count()
    }

    /// Provider-facing history. Observations are sent as user messages.
    pub fn to_messages(&self) -> Vec<Message> {
        self.turns
            .iter()
            .filter(|turn| !turn.kind.is_audit_only())
            .map(|turn| match turn.kind {
                TurnKind::Assistant => Message::assistant(turn.content.clone()),
                TurnKind::Observation => {
                    Message::user(format!("{}{}", OBSERVATION_PREFIX, turn.content))
                }
                _ => Message::user(turn.content.clone()),
            })
            .collect()
    }
}
