//! Conversation history persisted between agent invocations

use chrono::{DateTime, Local};
use genesis_config::paths::safe_filename;
use genesis_provider::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default maximum number of messages in a session
pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// History for one session key (usually `<user>:<conversation>`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Oldest messages are dropped beyond this count
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

/// A stored message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Local>,
    /// Free-form annotations such as the outcome of a run
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_max_messages(key, DEFAULT_MAX_MESSAGES)
    }

    pub fn with_max_messages(key: impl Into<String>, max_messages: usize) -> Self {
        let now = Local::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
            max_messages,
        }
    }

    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        self.add_message_with(role, content, HashMap::new());
    }

    /// Append a message carrying extra annotations
    pub fn add_message_with(
        &mut self,
        role: Role,
        content: impl Into<String>,
        extra: HashMap<String, serde_json::Value>,
    ) {
        self.messages.push(Message {
            role,
            content: content.into(),
            timestamp: Local::now(),
            extra,
        });
        self.updated_at = Local::now();
        self.enforce_max_messages();
    }

    fn enforce_max_messages(&mut self) {
        if self.messages.len() > self.max_messages {
            let to_remove = self.messages.len() - self.max_messages;
            self.messages.drain(0..to_remove);
            debug!(
                session = %self.key,
                kept = self.messages.len(),
                "session truncated"
            );
        }
    }

    /// The last `max_messages` messages, ready to hand to a provider
    pub fn get_history(&self, max_messages: usize) -> Vec<genesis_provider::Message> {
        self.messages
            .iter()
            .skip(self.messages.len().saturating_sub(max_messages))
            .map(|m| genesis_provider::Message {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Local::now();
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Change the limit, truncating immediately if needed
    pub fn set_max_messages(&mut self, max_messages: usize) {
        self.max_messages = max_messages;
        self.enforce_max_messages();
    }
}

/// Loads, caches and saves sessions as `<sessions_dir>/<key>.json`
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: HashMap<String, Session>,
    max_messages: usize,
}

impl SessionManager {
    pub fn new(sessions_dir: impl AsRef<Path>) -> Self {
        Self::with_max_messages(sessions_dir, DEFAULT_MAX_MESSAGES)
    }

    pub fn with_max_messages(sessions_dir: impl AsRef<Path>, max_messages: usize) -> Self {
        let sessions_dir = sessions_dir.as_ref().to_path_buf();
        if let Err(e) = std::fs::create_dir_all(&sessions_dir) {
            warn!(path = %sessions_dir.display(), error = %e, "could not create sessions dir");
        }

        Self {
            sessions_dir,
            cache: HashMap::new(),
            max_messages,
        }
    }

    /// Cached session, else the stored one, else a fresh one
    pub async fn get_or_create(&mut self, key: &str) -> &mut Session {
        if !self.cache.contains_key(key) {
            let session = self
                .load(key)
                .await
                .unwrap_or_else(|| Session::with_max_messages(key, self.max_messages));
            self.cache.insert(key.to_string(), session);
        }
        let max_messages = self.max_messages;
        self.cache
            .entry(key.to_string())
            .or_insert_with(|| Session::with_max_messages(key, max_messages))
    }

    /// Write a session to disk and refresh the cached copy
    pub async fn save(&mut self, session: &Session) -> std::io::Result<()> {
        let path = self.session_path(&session.key);
        let content = serde_json::to_string_pretty(session)?;
        tokio::fs::write(path, content).await?;
        self.cache.insert(session.key.clone(), session.clone());
        debug!(session = %session.key, "session saved");
        Ok(())
    }

    async fn load(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(session = %key, error = %e, "failed to read session");
                return None;
            }
        };

        match serde_json::from_str::<Session>(&content) {
            Ok(mut session) => {
                if session.max_messages != self.max_messages {
                    session.set_max_messages(self.max_messages);
                }
                debug!(session = %key, "session loaded");
                Some(session)
            }
            Err(e) => {
                warn!(session = %key, error = %e, "failed to parse session");
                None
            }
        }
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.json", safe_filename(key)))
    }

    /// Drop a session from the cache and disk; `false` if nothing was stored
    pub async fn delete(&mut self, key: &str) -> std::io::Result<bool> {
        self.cache.remove(key);
        match tokio::fs::remove_file(self.session_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Keys of every stored session, sorted
    pub async fn list(&self) -> Vec<String> {
        let mut keys = Vec::new();

        if let Ok(mut entries) = tokio::fs::read_dir(&self.sessions_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(content) = tokio::fs::read_to_string(&path).await else {
                    continue;
                };
                match serde_json::from_str::<Session>(&content) {
                    Ok(session) => keys.push(session.key),
                    Err(e) => warn!(path = %path.display(), error = %e, "unreadable session file"),
                }
            }
        }

        keys.sort();
        keys
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Apply a new limit to cached and future sessions
    pub fn set_max_messages(&mut self, max_messages: usize) {
        self.max_messages = max_messages;
        for session in self.cache.values_mut() {
            session.set_max_messages(max_messages);
        }
    }
}
