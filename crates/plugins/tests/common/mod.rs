//! Shared helpers: small `sh` plugins written into temp directories

#![allow(dead_code)]

use genesis_plugins::{ActionExecutor, ExecutorSettings, PluginRegistry};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub struct TestEnv {
    pub temp: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
        }
    }

    pub fn system_dir(&self) -> PathBuf {
        self.temp.path().join("plugins")
    }

    pub fn users_dir(&self) -> PathBuf {
        self.temp.path().join("users")
    }

    pub fn homes_dir(&self) -> PathBuf {
        self.temp.path().join("home")
    }

    pub fn registry(&self) -> PluginRegistry {
        PluginRegistry::new(self.system_dir(), self.users_dir())
    }

    pub fn executor(&self) -> ActionExecutor {
        self.executor_with(4, 1024 * 1024)
    }

    pub fn executor_with(&self, max_concurrent: usize, max_output_bytes: usize) -> ActionExecutor {
        ActionExecutor::new(ExecutorSettings {
            max_concurrent,
            max_output_bytes,
            homes_dir: self.homes_dir(),
        })
    }
}

/// One action of a test plugin
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

    /// Merge extra manifest fields (parameters, cache_ttl, trigger...)
    pub fn with(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

/// Write `<dir>/manifest.json` plus one `sh` script per action.
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

/// Plugin whose actions just print a success object
pub fn write_simple_plugin(dir: &Path, id: &str, action_names: &[&str]) {
    let actions = action_names
        .iter()
        .map(|name| {
            TestAction::new(
                name,
                &format!("echo '{{\"status\":\"success\",\"from\":\"{}\"}}'\n", id),
            )
        })
        .collect();
    write_plugin(dir, id, actions);
}

/// Whether `pid` still names a live (non-zombie) process
pub fn process_alive(pid: i32) -> bool {
    let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat,
        Err(_) => return false,
    };
    // Field 3 is the state; `Z` is a zombie waiting to be reaped
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next());
    !matches!(state, Some("Z") | Some("X") | None)
}

/// Poll until `pid` is gone or two seconds pass
pub async fn wait_until_dead(pid: i32) -> bool {
    for _ in 0..40 {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub async fn read_pid(path: &Path) -> i32 {
    for _ in 0..40 {
        if let Ok(text) = tokio::fs::read_to_string(path).await {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("pid file {} never written", path.display());
}
