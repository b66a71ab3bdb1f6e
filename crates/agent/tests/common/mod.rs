//! Shared helpers: a scripted provider and small `sh` plugins

#![allow(dead_code)]

use async_trait::async_trait;
use genesis_agent::{AgentLoop, AgentSettings};
use genesis_plugins::{ActionExecutor, ExecutorSettings, PluginRegistry, Scope};
use genesis_provider::{GenerateRequest, Provider, ProviderError};
use mockall::mock;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

mock! {
    pub Provider {}

    #[async_trait]
    impl Provider for Provider {
        async fn generate(&self, request: GenerateRequest) -> Result<String, ProviderError>;
        fn default_model(&self) -> String;
        fn is_configured(&self) -> bool;
    }
}

/// Every request the mock has seen, in order
pub type Seen = Arc<Mutex<Vec<GenerateRequest>>>;

/// A provider that answers with `replies` in order and must be called
/// exactly that many times.
pub fn scripted(replies: Vec<Result<String, ProviderError>>) -> (MockProvider, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let count = replies.len();
    let queue = Arc::new(Mutex::new(VecDeque::from(replies)));

    let mut mock = MockProvider::new();
    let log = seen.clone();
    mock.expect_generate().times(count).returning(move |request| {
        log.lock().unwrap().push(request);
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Unavailable("script exhausted".into())))
    });
    (mock, seen)
}

/// Same reply forever, counting calls
pub fn repeating(reply: &str) -> (MockProvider, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let reply = reply.to_string();
    let mut mock = MockProvider::new();
    let log = seen.clone();
    mock.expect_generate().returning(move |request| {
        log.lock().unwrap().push(request);
        Ok(reply.clone())
    });
    (mock, seen)
}

pub fn ok(text: &str) -> Result<String, ProviderError> {
    Ok(text.to_string())
}

pub fn call(action: &str, params: Value) -> Result<String, ProviderError> {
    Ok(json!({"thought": format!("use {}", action), "action": action, "params": params}).to_string())
}

pub fn answer(text: &str) -> Result<String, ProviderError> {
    Ok(json!({"thought": "done", "final_answer": text}).to_string())
}

pub fn fast_settings() -> AgentSettings {
    AgentSettings {
        max_steps: 5,
        max_parse_retries: 1,
        max_consecutive_infra_errors: 3,
        provider_timeout: Duration::from_secs(5),
        action_timeout: Duration::from_secs(5),
        max_wall_clock: Duration::from_secs(30),
        ..AgentSettings::default()
    }
}

pub struct TestEnv {
    pub temp: TempDir,
    pub registry: Arc<PluginRegistry>,
    pub executor: Arc<ActionExecutor>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(PluginRegistry::new(
            temp.path().join("plugins"),
            temp.path().join("users"),
        ));
        let executor = Arc::new(ActionExecutor::new(ExecutorSettings {
            max_concurrent: 4,
            max_output_bytes: 1024 * 1024,
            homes_dir: temp.path().join("home"),
        }));
        Self {
            temp,
            registry,
            executor,
        }
    }

    pub fn system_dir(&self) -> PathBuf {
        self.temp.path().join("plugins")
    }

    pub fn agent(&self, provider: MockProvider, settings: AgentSettings) -> AgentLoop<MockProvider> {
        AgentLoop::new(provider, self.registry.clone(), self.executor.clone(), settings)
    }

    /// Write a one-action plugin under the system dir and load it
    pub async fn install(&self, scope: &Scope, id: &str, actions: Vec<TestAction>) {
        let dir = self.temp.path().join("src").join(id);
        write_plugin(&dir, id, actions);
        self.registry.load(scope, &dir).await.unwrap();
    }
}

pub struct TestAction {
    pub name: String,
    pub body: String,
    pub extra: Value,
}

impl TestAction {
    pub fn new(name: &str, body: &str) -> Self {
        Self {
            name: name.to_string(),
            body: body.to_string(),
            extra: json!({}),
        }
    }

    pub fn with(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

pub fn write_plugin(dir: &Path, id: &str, actions: Vec<TestAction>) {
    std::fs::create_dir_all(dir).unwrap();
    let mut declared = Vec::new();
    for action in actions {
        let script = format!("{}.sh", action.name);
        std::fs::write(dir.join(&script), &action.body).unwrap();
        let mut spec = json!({
            "name": action.name,
            "script": script,
            "type": "process",
            "interpreter": "sh",
            "description": format!("{} test action", action.name),
        });
        if let (Some(spec), Some(extra)) = (spec.as_object_mut(), action.extra.as_object()) {
            for (k, v) in extra {
                spec.insert(k.clone(), v.clone());
            }
        }
        declared.push(spec);
    }
    let manifest = json!({
        "id": id,
        "name": id,
        "version": "1.0.0",
        "description": format!("{} test plugin", id),
        "actions": declared,
    });
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

pub const HELLO: &str = r#"input=$(cat)
target=$(printf '%s' "$input" | sed -n 's/.*"target"[[:space:]]*:[[:space:]]*"\([^"]*\)".*/\1/p')
printf '{"status":"success","message":"Hello, %s!"}\n' "$target"
"#;

pub fn hello_action() -> TestAction {
    TestAction::new("hello", HELLO).with(json!({
        "description": "Greet someone",
        "parameters": { "target": "string: who to greet" }
    }))
}

pub fn process_alive(pid: i32) -> bool {
    let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat,
        Err(_) => return false,
    };
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next());
    !matches!(state, Some("Z") | Some("X") | None)
}

pub async fn wait_until_dead(pid: i32) -> bool {
    for _ in 0..40 {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
