//! Executor tests against real `sh` processes

#![cfg(unix)]

mod common;

use common::{read_pid, wait_until_dead, write_plugin, TestAction, TestEnv};
use genesis_plugins::{
    ActionExecutor, ActionOutcome, ActionSpec, ExecutorError, InfraKind, PluginManifest, Scope,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn single_action(env: &TestEnv, action: TestAction) -> Arc<ActionSpec> {
    let dir = env.temp.path().join("plugin");
    let name = action.name.clone();
    write_plugin(&dir, "test-plugin", vec![action]);
    let manifest = PluginManifest::load(&dir).await.unwrap();
    manifest.action(&name).unwrap().clone()
}

const HELLO: &str = r#"input=$(cat)
target=$(printf '%s' "$input" | sed -n 's/.*"target"[[:space:]]*:[[:space:]]*"\([^"]*\)".*/\1/p')
printf '{"status":"success","message":"Hello, %s!"}\n' "$target"
"#;

#[tokio::test]
async fn test_success_payload() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new("hello", HELLO).with(json!({
            "parameters": { "target": "string: who to greet" }
        })),
    )
    .await;

    let result = env
        .executor()
        .execute(
            &action,
            &Scope::System,
            &json!({ "target": "World" }),
            TIMEOUT,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    match result.outcome {
        ActionOutcome::Success { payload } => {
            assert_eq!(payload.get("message"), Some(&json!("Hello, World!")));
            assert!(payload.get("status").is_none());
        }
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.cached);
}

#[tokio::test]
async fn test_error_field_is_failure() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new("fail", "echo '{\"error\":\"file not found\"}'\nexit 1\n"),
    )
    .await;

    let result = env
        .executor()
        .execute(&action, &Scope::System, &json!({}), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        result.outcome,
        ActionOutcome::Failure {
            message: "file not found".to_string()
        }
    );
}

#[tokio::test]
async fn test_argument_invalid_never_starts_process() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new("marker", "touch \"$GENESIS_HOME/ran\"\necho '{}'\n").with(json!({
            "parameters": { "count": "integer: how many" }
        })),
    )
    .await;
    let executor = env.executor();

    let err = executor
        .execute(
            &action,
            &Scope::System,
            &json!({ "count": "many" }),
            TIMEOUT,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::ArgumentInvalid { ref field, .. } if field == "count"));

    let err = executor
        .execute(&action, &Scope::System, &json!({}), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::ArgumentInvalid { .. }));

    assert!(!executor.home_for(&Scope::System).join("ran").exists());
}

#[tokio::test]
async fn test_timeout_kills_process() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new("slow", "echo $$ > \"$GENESIS_HOME/pid\"\nexec sleep 30\n"),
    )
    .await;
    let executor = env.executor();

    let started = Instant::now();
    let result = executor
        .execute(
            &action,
            &Scope::System,
            &json!({}),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        result.outcome,
        ActionOutcome::InfraError {
            kind: InfraKind::Timeout,
            ..
        }
    ));

    let pid = read_pid(&executor.home_for(&Scope::System).join("pid")).await;
    assert!(wait_until_dead(pid).await, "process {} survived its deadline", pid);
}

#[tokio::test]
async fn test_timeout_kills_background_children() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new(
            "spawner",
            "sleep 30 &\necho $! > \"$GENESIS_HOME/child\"\nwait\n",
        ),
    )
    .await;
    let executor = env.executor();

    let result = executor
        .execute(
            &action,
            &Scope::System,
            &json!({}),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.is_infra_error());

    let child = read_pid(&executor.home_for(&Scope::System).join("child")).await;
    assert!(wait_until_dead(child).await, "grandchild {} survived", child);
}

#[tokio::test]
async fn test_cancellation_kills_process() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new("slow", "echo $$ > \"$GENESIS_HOME/pid\"\nexec sleep 30\n"),
    )
    .await;
    let executor = Arc::new(env.executor());
    let cancel = CancellationToken::new();

    let task = {
        let executor = executor.clone();
        let cancel = cancel.clone();
        let action = action.clone();
        tokio::spawn(async move {
            executor
                .execute(&action, &Scope::System, &json!({}), TIMEOUT, &cancel)
                .await
        })
    };

    let pid = read_pid(&executor.home_for(&Scope::System).join("pid")).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err(), ExecutorError::Cancelled);
    assert!(wait_until_dead(pid).await);
}

#[tokio::test]
async fn test_shutdown_kills_in_flight_and_rejects_new_work() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new("slow", "echo $$ > \"$GENESIS_HOME/pid\"\nexec sleep 30\n"),
    )
    .await;
    let executor = Arc::new(env.executor());

    let task = {
        let executor = executor.clone();
        let action = action.clone();
        tokio::spawn(async move {
            executor
                .execute(&action, &Scope::System, &json!({}), TIMEOUT, &CancellationToken::new())
                .await
        })
    };

    let pid = read_pid(&executor.home_for(&Scope::System).join("pid")).await;
    executor.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err(), ExecutorError::Cancelled);
    assert!(wait_until_dead(pid).await);

    let again = executor
        .execute(&action, &Scope::System, &json!({}), TIMEOUT, &CancellationToken::new())
        .await;
    assert_eq!(again.unwrap_err(), ExecutorError::Cancelled);
}

#[tokio::test]
async fn test_malformed_outputs() {
    let env = TestEnv::new();
    let executor = env.executor();

    for (name, body) in [
        ("plain_text", "echo 'all good'\n"),
        ("silent", "true\n"),
        ("two_results", "echo '{\"a\":1}'\necho '{\"b\":2}'\n"),
        ("exit_nonzero", "echo 'oops' >&2\nexit 3\n"),
        ("odd_status", "echo '{\"status\":\"maybe\"}'\n"),
    ] {
        let action = single_action(&env, TestAction::new(name, body)).await;
        let result = executor
            .execute(&action, &Scope::System, &json!({}), TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert!(
            matches!(
                result.outcome,
                ActionOutcome::InfraError {
                    kind: InfraKind::MalformedOutput,
                    ..
                }
            ),
            "{}: {:?}",
            name,
            result.outcome
        );
    }
}

#[tokio::test]
async fn test_stderr_is_diagnostic_only() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new(
            "noisy",
            "echo '{\"error\":\"ignored\"}' >&2\necho '{\"ok\":true}'\n",
        ),
    )
    .await;

    let result = env
        .executor()
        .execute(&action, &Scope::System, &json!({}), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_success());
    assert!(result.stderr.contains("ignored"));
}

#[tokio::test]
async fn test_signal_is_process_crash() {
    let env = TestEnv::new();
    let action = single_action(&env, TestAction::new("crash", "kill -9 $$\n")).await;

    let result = env
        .executor()
        .execute(&action, &Scope::System, &json!({}), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        result.outcome,
        ActionOutcome::InfraError {
            kind: InfraKind::ProcessCrash,
            ..
        }
    ));
}

#[tokio::test]
async fn test_progress_lines_ignored() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new(
            "progress",
            "echo '{\"status\":\"progress\",\"message\":\"step 1\"}'\necho '{\"status\":\"success\",\"done\":true}'\n",
        ),
    )
    .await;

    let result = env
        .executor()
        .execute(&action, &Scope::System, &json!({}), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    match result.outcome {
        ActionOutcome::Success { payload } => assert_eq!(payload.get("done"), Some(&json!(true))),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_output_is_malformed() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new("flood", "head -c 5000 /dev/zero | tr '\\0' 'a'\n"),
    )
    .await;

    let result = env
        .executor_with(1, 1024)
        .execute(&action, &Scope::System, &json!({}), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    match result.outcome {
        ActionOutcome::InfraError {
            kind: InfraKind::MalformedOutput,
            detail,
        } => assert!(detail.contains("exceeded 1024 bytes")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_environment_and_working_home_per_scope() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new(
            "where",
            r#"printf '{"home":"%s","cwd":"%s","action":"%s","plugin":"%s","user_home":"%s","args":%s}\n' "$GENESIS_HOME" "$(pwd -P)" "$GENESIS_ACTION" "$GENESIS_PLUGIN_PATH" "$HOME" "$ACTION_ARGS"
"#,
        ),
    )
    .await;
    let executor = env.executor();

    for scope in [Scope::System, Scope::user("alice")] {
        let result = executor
            .execute(&action, &scope, &json!({ "k": 1 }), TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        let payload = match result.outcome {
            ActionOutcome::Success { payload } => payload,
            other => panic!("unexpected {:?}", other),
        };

        let home = executor.home_for(&scope);
        let canonical_home = std::fs::canonicalize(&home).unwrap();
        assert_eq!(payload["home"], json!(home.to_string_lossy()));
        assert_eq!(payload["user_home"], json!(home.to_string_lossy()));
        assert_eq!(payload["cwd"], json!(canonical_home.to_string_lossy()));
        assert_eq!(payload["action"], json!("where"));
        assert_eq!(payload["plugin"], json!(action.plugin_root.to_string_lossy()));
        assert_eq!(payload["args"], json!({ "k": 1 }));
    }

    assert!(executor.home_for(&Scope::System).ends_with("_system"));
    assert!(executor
        .home_for(&Scope::user("alice"))
        .ends_with("users/alice"));
    assert_ne!(
        executor.home_for(&Scope::user("a:b")),
        executor.home_for(&Scope::user("a_b"))
    );
}

#[tokio::test]
async fn test_cached_results_skip_process() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new(
            "counted",
            "echo run >> \"$GENESIS_HOME/runs\"\necho '{\"status\":\"success\",\"n\":1}'\n",
        )
        .with(json!({ "cache_ttl": 60 })),
    )
    .await;
    let executor = env.executor();
    let cancel = CancellationToken::new();

    let first = executor
        .execute(&action, &Scope::System, &json!({ "q": "x" }), TIMEOUT, &cancel)
        .await
        .unwrap();
    let second = executor
        .execute(&action, &Scope::System, &json!({ "q": "x" }), TIMEOUT, &cancel)
        .await
        .unwrap();
    let other_args = executor
        .execute(&action, &Scope::System, &json!({ "q": "y" }), TIMEOUT, &cancel)
        .await
        .unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.outcome, second.outcome);
    assert!(!other_args.cached);

    let runs = std::fs::read_to_string(executor.home_for(&Scope::System).join("runs")).unwrap();
    assert_eq!(runs.lines().count(), 2);
}

#[tokio::test]
async fn test_unbounded_ttl_and_timeout_do_not_overflow() {
    let env = TestEnv::new();
    let action = single_action(
        &env,
        TestAction::new("forever", "echo '{\"status\":\"success\",\"n\":1}'\n")
            .with(json!({ "cache_ttl": u64::MAX })),
    )
    .await;
    assert_eq!(action.cache_ttl, Duration::from_secs(u64::MAX));

    let executor = env.executor();
    let cancel = CancellationToken::new();
    let first = executor
        .execute(&action, &Scope::System, &json!({}), Duration::MAX, &cancel)
        .await
        .unwrap();
    let second = executor
        .execute(&action, &Scope::System, &json!({}), Duration::MAX, &cancel)
        .await
        .unwrap();

    assert!(first.is_success());
    assert!(!first.cached);
    assert!(second.cached);
}

#[tokio::test]
async fn test_concurrency_limit_applies_deadline_to_queueing() {
    let env = TestEnv::new();
    let slow = single_action(
        &env,
        TestAction::new("slow", "echo $$ > \"$GENESIS_HOME/pid\"\nexec sleep 30\n"),
    )
    .await;
    let executor: Arc<ActionExecutor> = Arc::new(env.executor_with(1, 1024 * 1024));
    let cancel = CancellationToken::new();

    let holder = {
        let executor = executor.clone();
        let cancel = cancel.clone();
        let slow = slow.clone();
        tokio::spawn(async move {
            executor
                .execute(&slow, &Scope::System, &json!({}), TIMEOUT, &cancel)
                .await
        })
    };
    let pid = read_pid(&executor.home_for(&Scope::System).join("pid")).await;

    let queued = executor
        .execute(
            &slow,
            &Scope::System,
            &json!({}),
            Duration::from_millis(200),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    match queued.outcome {
        ActionOutcome::InfraError {
            kind: InfraKind::Timeout,
            detail,
        } => assert!(detail.contains("no execution slot")),
        other => panic!("unexpected {:?}", other),
    }

    cancel.cancel();
    let _ = holder.await.unwrap();
    assert!(wait_until_dead(pid).await);
}
