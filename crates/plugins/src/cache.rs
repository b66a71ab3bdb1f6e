//! TTL cache for successful action payloads

use crate::catalog::Scope;
use crate::manifest::{canonical_json, ActionSpec};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    plugin_id: String,
    action: String,
    generation: u64,
    scope: Scope,
    arguments: String,
}

impl CacheKey {
    pub fn new(
        plugin_id: &str,
        action: &str,
        generation: u64,
        scope: &Scope,
        arguments: &Value,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            action: action.to_string(),
            generation,
            scope: scope.clone(),
            arguments: canonical_json(arguments),
        }
    }

    pub fn for_action(action: &ActionSpec, scope: &Scope, arguments: &Value) -> Self {
        Self::new(&action.plugin_id, &action.name, action.generation, scope, arguments)
    }
}

struct Entry {
    payload: Map<String, Value>,
    /// `None` when the ttl runs past what `Instant` can represent
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh payload for `key`; expired entries are dropped on the way.
    pub fn get(&self, key: &CacheKey) -> Option<Map<String, Value>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        if entry.is_fresh(Instant::now()) {
            return Some(entry.payload.clone());
        }
        entries.remove(key);
        None
    }

    pub fn put(&self, key: CacheKey, payload: Map<String, Value>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_fresh(now));
        entries.insert(
            key,
            Entry {
                payload,
                expires_at: now.checked_add(ttl),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
