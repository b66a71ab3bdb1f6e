//! Action executor
//!
//! Each invocation runs as a child process in its own process group,
//! rooted in the caller's working home with a scrubbed environment.
//! Arguments go in on stdin as one JSON object; stdout must carry exactly
//! one JSON result object. Stderr is kept for diagnostics only.
//!
//! The group is killed on every exit path (normal exit, deadline, caller
//! cancellation, executor shutdown), so no descendant outlives the call.

use crate::cache::{CacheKey, ResultCache};
use crate::catalog::Scope;
use crate::error::{ExecutorError, RunError};
use crate::manifest::{ActionKind, ActionSpec};
use crate::registry::PluginRegistry;
use crate::ActionRequest;
use genesis_config::{paths, Config};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long output readers may keep draining after the process is gone
const READER_GRACE: Duration = Duration::from_millis(500);

/// Larger payloads are passed on stdin only
const MAX_ENV_ARGS: usize = 64 * 1024;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Stand-in for "no deadline" when `now + timeout` does not fit an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

pub(crate) fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Infrastructure failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfraKind {
    Timeout,
    MalformedOutput,
    ProcessCrash,
}

impl fmt::Display for InfraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InfraKind::Timeout => "timeout",
            InfraKind::MalformedOutput => "malformed output",
            InfraKind::ProcessCrash => "process crash",
        })
    }
}

/// Classified result of one invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Result object minus its `status` field
    Success { payload: Map<String, Value> },
    /// The action reported an `error`
    Failure { message: String },
    InfraError { kind: InfraKind, detail: String },
}

#[derive(Debug, Clone)]
pub struct ActionResult {
    pub outcome: ActionOutcome,
    pub elapsed: Duration,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Served from the result cache without launching a process
    pub cached: bool,
}

impl ActionResult {
    fn new(outcome: ActionOutcome, elapsed: Duration) -> Self {
        Self {
            outcome,
            elapsed,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            cached: false,
        }
    }

    fn infra(kind: InfraKind, detail: impl Into<String>, elapsed: Duration) -> Self {
        Self::new(
            ActionOutcome::InfraError {
                kind,
                detail: detail.into(),
            },
            elapsed,
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Success { .. })
    }

    pub fn is_infra_error(&self) -> bool {
        matches!(self.outcome, ActionOutcome::InfraError { .. })
    }
}

/// Executor limits
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_concurrent: usize,
    pub max_output_bytes: usize,
    /// Root of per-scope working homes
    pub homes_dir: PathBuf,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent: config.executor.max_concurrent_actions,
            max_output_bytes: config.executor.max_output_bytes,
            homes_dir: config.homes_dir(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_output_bytes: 1024 * 1024,
            homes_dir: paths::homes_dir(),
        }
    }
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

pub struct ActionExecutor {
    settings: ExecutorSettings,
    permits: Semaphore,
    cache: ResultCache,
    shutdown: CancellationToken,
}

impl ActionExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            permits: Semaphore::new(settings.max_concurrent.max(1)),
            settings,
            cache: ResultCache::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ExecutorSettings::from_config(config))
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Working directory for processes launched on behalf of `scope`
    pub fn home_for(&self, scope: &Scope) -> PathBuf {
        match scope {
            Scope::System => paths::system_home(&self.settings.homes_dir),
            Scope::User(id) => paths::user_home(&self.settings.homes_dir, id),
        }
    }

    /// Kill everything in flight and refuse new work.
    pub fn shutdown(&self) {
        info!("action executor shutting down");
        self.shutdown.cancel();
        self.permits.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `action` for `scope` with `args`, giving it `timeout` to finish.
    ///
    /// Contract violations and cancellation come back as `Err`; everything
    /// the process itself did is classified into the `ActionResult`.
    pub async fn execute(
        &self,
        action: &ActionSpec,
        scope: &Scope,
        args: &Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ActionResult, ExecutorError> {
        action.parameters.validate(args)?;
        if cancel.is_cancelled() || self.shutdown.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        let cache_key = (!action.cache_ttl.is_zero())
            .then(|| CacheKey::for_action(action, scope, args));
        if let Some(payload) = cache_key.as_ref().and_then(|key| self.cache.get(key)) {
            debug!(action = %action.name, "action result served from cache");
            let mut result = ActionResult::new(ActionOutcome::Success { payload }, Duration::ZERO);
            result.cached = true;
            return Ok(result);
        }

        let started = Instant::now();
        let deadline = deadline_after(timeout);

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| ExecutorError::Cancelled)?,
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(ActionResult::infra(
                    InfraKind::Timeout,
                    format!("no execution slot free within {:?}", timeout),
                    started.elapsed(),
                ));
            }
            _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
            _ = self.shutdown.cancelled() => return Err(ExecutorError::Cancelled),
        };

        let result = match action.kind {
            ActionKind::Process => {
                self.run_process(action, scope, args, timeout, deadline, cancel, started)
                    .await?
            }
        };

        let elapsed_ms = result.elapsed.as_millis() as u64;
        match &result.outcome {
            ActionOutcome::Success { payload } => {
                debug!(action = %action.name, elapsed_ms, "action succeeded");
                if let Some(key) = cache_key {
                    self.cache.put(key, payload.clone(), action.cache_ttl);
                }
            }
            ActionOutcome::Failure { message } => {
                info!(action = %action.name, elapsed_ms, message = %message, "action reported failure");
            }
            ActionOutcome::InfraError { kind, detail } => {
                warn!(
                    action = %action.name,
                    plugin_id = %action.plugin_id,
                    kind = %kind,
                    detail = %detail,
                    elapsed_ms,
                    exit_code = ?result.exit_code,
                    stderr = %result.stderr.trim(),
                    "action infrastructure error"
                );
            }
        }
        Ok(result)
    }

    /// Resolve `request` in `registry` and execute it.
    ///
    /// The action is taken from the catalog snapshot current at call time;
    /// a reload while it runs does not affect this invocation.
    pub async fn run(
        &self,
        registry: &PluginRegistry,
        request: &ActionRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ActionResult, RunError> {
        let action = registry.resolve(&request.scope, &request.name)?;
        Ok(self
            .execute(&action, &request.scope, &request.arguments, timeout, cancel)
            .await?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_process(
        &self,
        action: &ActionSpec,
        scope: &Scope,
        args: &Value,
        timeout: Duration,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ActionResult, ExecutorError> {
        let home = self.home_for(scope);
        if let Err(e) = tokio::fs::create_dir_all(&home).await {
            return Ok(ActionResult::infra(
                InfraKind::ProcessCrash,
                format!("cannot prepare {}: {}", home.display(), e),
                started.elapsed(),
            ));
        }

        let payload = match args {
            Value::Null => "{}".to_string(),
            other => other.to_string(),
        };
        let mut command = build_command(action, &home, &payload);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(ActionResult::infra(
                    InfraKind::ProcessCrash,
                    format!("failed to start {}: {}", action.script.display(), e),
                    started.elapsed(),
                ));
            }
        };
        let pid = child.id();
        debug!(action = %action.name, pid = ?pid, home = %home.display(), "action started");

        if let Some(mut stdin) = child.stdin.take() {
            let bytes = payload.into_bytes();
            tokio::spawn(async move {
                // The process may exit without reading its input
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            });
        }
        let limit = self.settings.max_output_bytes;
        let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_capped(out, limit)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_capped(err, limit)));

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status),
            _ = tokio::time::sleep_until(deadline) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
            _ = self.shutdown.cancelled() => Exit::Cancelled,
        };

        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        if !matches!(exit, Exit::Finished(_)) {
            if let Err(e) = child.kill().await {
                warn!(action = %action.name, error = %e, "failed to kill action process");
            }
        }

        let (stdout, stdout_truncated) = collect(stdout_task).await;
        let (stderr, _) = collect(stderr_task).await;
        let elapsed = started.elapsed();

        let (outcome, exit_code) = match exit {
            Exit::Cancelled => {
                info!(action = %action.name, elapsed_ms = elapsed.as_millis() as u64, "action cancelled");
                return Err(ExecutorError::Cancelled);
            }
            Exit::TimedOut => (
                ActionOutcome::InfraError {
                    kind: InfraKind::Timeout,
                    detail: format!("no result within {:?}", timeout),
                },
                None,
            ),
            Exit::Finished(Err(e)) => (
                ActionOutcome::InfraError {
                    kind: InfraKind::ProcessCrash,
                    detail: format!("lost track of process: {}", e),
                },
                None,
            ),
            Exit::Finished(Ok(status)) => {
                let outcome = if stdout_truncated {
                    ActionOutcome::InfraError {
                        kind: InfraKind::MalformedOutput,
                        detail: format!("output exceeded {} bytes", limit),
                    }
                } else {
                    classify(&stdout, status)
                };
                (outcome, status.code())
            }
        };

        Ok(ActionResult {
            outcome,
            elapsed,
            stdout,
            stderr,
            exit_code,
            cached: false,
        })
    }
}

fn build_command(action: &ActionSpec, home: &Path, payload: &str) -> Command {
    let mut command = match &action.interpreter {
        Some(interpreter) => {
            let mut command = Command::new(interpreter);
            command.arg(&action.script);
            command
        }
        None => Command::new(&action.script),
    };

    command
        .env_clear()
        .env(
            "PATH",
            std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
        )
        .env("HOME", home)
        .env("GENESIS_HOME", home)
        .env("GENESIS_PLUGIN_PATH", &action.plugin_root)
        .env("GENESIS_ACTION", &action.name)
        .current_dir(home)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if payload.len() <= MAX_ENV_ARGS {
        command.env("ACTION_ARGS", payload);
    }
    #[cfg(unix)]
    command.process_group(0);

    command
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg takes plain integers; ESRCH only means the group is empty.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Read to EOF, keeping at most `limit` bytes. Returns whether anything was dropped.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(out.len());
                if n > room {
                    out.extend_from_slice(&buf[..room]);
                    truncated = true;
                } else {
                    out.extend_from_slice(&buf[..n]);
                }
            }
        }
    }
    (out, truncated)
}

async fn collect(task: Option<JoinHandle<(Vec<u8>, bool)>>) -> (String, bool) {
    let Some(mut task) = task else {
        return (String::new(), false);
    };
    match tokio::time::timeout(READER_GRACE, &mut task).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Err(_)) => (String::new(), false),
        Err(_) => {
            task.abort();
            (String::new(), false)
        }
    }
}

fn is_progress(line: &str) -> bool {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(Value::Object(map)) => map.get("status").and_then(Value::as_str) == Some("progress"),
        _ => false,
    }
}

fn killed_by_signal(status: &ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

/// Outcome when stdout holds no usable result
fn no_payload(status: ExitStatus, reason: String) -> ActionOutcome {
    if let Some(signal) = killed_by_signal(&status) {
        return ActionOutcome::InfraError {
            kind: InfraKind::ProcessCrash,
            detail: format!("terminated by signal {}; {}", signal, reason),
        };
    }
    let detail = match status.code() {
        Some(code) if code != 0 => format!("exited with code {}; {}", code, reason),
        _ => reason,
    };
    ActionOutcome::InfraError {
        kind: InfraKind::MalformedOutput,
        detail,
    }
}

/// Map captured stdout to an outcome.
///
/// Progress lines are dropped; what remains must be one JSON object.
/// An `error` field makes it a failure, otherwise `status` must be absent
/// or `"success"`.
pub(crate) fn classify(stdout: &str, status: ExitStatus) -> ActionOutcome {
    let mut body = String::new();
    for line in stdout.lines() {
        if is_progress(line) {
            debug!(progress = %line.trim(), "action progress");
            continue;
        }
        body.push_str(line);
        body.push('\n');
    }
    let body = body.trim();
    if body.is_empty() {
        return no_payload(status, "no output".to_string());
    }

    let mut map = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return no_payload(status, "result is not a JSON object".to_string()),
        Err(e) => {
            return no_payload(
                status,
                format!("output is not a single JSON object ({})", e),
            )
        }
    };

    match map.get("error") {
        None | Some(Value::Null) => {}
        Some(Value::String(message)) => {
            return ActionOutcome::Failure {
                message: message.clone(),
            }
        }
        Some(other) => {
            return ActionOutcome::Failure {
                message: other.to_string(),
            }
        }
    }

    match map.remove("status") {
        None => ActionOutcome::Success { payload: map },
        Some(Value::String(s)) if s == "success" => ActionOutcome::Success { payload: map },
        Some(other) => ActionOutcome::InfraError {
            kind: InfraKind::MalformedOutput,
            detail: format!("unexpected status {}", other),
        },
    }
}
