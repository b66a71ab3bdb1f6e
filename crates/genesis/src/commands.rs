//! Genesis command implementations

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use genesis_agent::{build_agent, describe_result, provider_from_config, AgentLoop, LoopResult};
use genesis_config::{self, paths, Config};
use genesis_plugins::{ActionExecutor, ActionRequest, PluginRegistry, ReloadReport, Scope};
use genesis_provider::Provider;

/// Options for `genesis engage`
pub struct EngageArgs {
    pub message: Option<String>,
    pub user: Option<String>,
    pub session: String,
    pub max_steps: Option<u32>,
}

fn scope_for(user: Option<String>) -> Scope {
    match user {
        Some(user) => Scope::user(user),
        None => Scope::System,
    }
}

/// Registry holding the system plugins plus those of `scope`
async fn open_registry(config: &Config, scope: &Scope) -> Result<PluginRegistry> {
    let registry = PluginRegistry::from_config(config);
    report_rejected(&Scope::System, &registry.reload(&Scope::System).await?);
    if !scope.is_system() {
        report_rejected(scope, &registry.reload(scope).await?);
    }
    Ok(registry)
}

fn report_rejected(scope: &Scope, report: &ReloadReport) {
    for rejected in &report.rejected {
        warn!(
            scope = %scope,
            path = %rejected.path.display(),
            reason = %rejected.reason,
            "plugin not loaded"
        );
    }
}

/// Initialize config, data directories and the sample plugin
pub async fn init_command() -> Result<()> {
    println!("◆ Initializing Genesis...");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = genesis_config::init().await?;
    let plugin_dir = config.system_plugins_dir().join("hello_world");
    create_sample_plugin(&plugin_dir).await?;

    println!("\n◆ Genesis initialized at {}", paths::data_dir().display());
    println!("\nNext steps:");
    println!(
        "  1. Add your API key to {}",
        genesis_config::config_path().display()
    );
    println!("  2. Try a plugin:   genesis plugins run hello --args '{{\"target\":\"World\"}}'");
    println!("  3. Start chatting: genesis engage -m \"Hello!\"");

    Ok(())
}

async fn create_sample_plugin(dir: &Path) -> Result<()> {
    if dir.join(genesis_plugins::MANIFEST_FILE).exists() {
        return Ok(());
    }
    paths::ensure_dir(dir).await?;
    create_template(dir, genesis_plugins::MANIFEST_FILE, HELLO_MANIFEST).await?;
    create_template(dir, "hello.sh", HELLO_SCRIPT).await?;
    Ok(())
}

async fn create_template(dir: &Path, filename: &str, content: &str) -> Result<()> {
    let path = dir.join(filename);
    if !path.exists() {
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("◆ Created {}", path.display());
    }
    Ok(())
}

/// Run one task, cancelling it on Ctrl+C
async fn run_task<P: Provider>(
    agent: &AgentLoop<P>,
    scope: &Scope,
    session: &str,
    task: &str,
) -> LoopResult {
    let cancel = CancellationToken::new();
    let run = agent.process(scope, session, task, cancel.clone());
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("◆ Interrupt received, cancelling task");
            cancel.cancel();
            run.await
        }
    }
}

/// Chat with the agent
pub async fn engage_command(args: EngageArgs) -> Result<()> {
    let mut config = Config::load().await?;
    if let Some(max_steps) = args.max_steps {
        config.agent.defaults.max_steps = max_steps;
    }

    let provider = provider_from_config(&config).with_context(|| {
        format!(
            "No API key configured. Set one in {}",
            genesis_config::config_path().display()
        )
    })?;
    let agent = build_agent(&config, provider).await?;
    let scope = scope_for(args.user);

    if let Some(msg) = args.message {
        let result = run_task(&agent, &scope, &args.session, &msg).await;
        println!("\n◆ {}", result.outcome.user_message());
        if !result.outcome.is_done() {
            anyhow::bail!("task aborted after {} steps", result.steps);
        }
    } else {
        println!("◆ Interactive mode (type 'exit' to quit)");
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        loop {
            print!("◆ ");
            std::io::stdout().flush()?;

            let mut input = String::new();
            if std::io::stdin().read_line(&mut input)? == 0 {
                break;
            }

            let input = input.trim();
            if input.is_empty() {
                continue;
            }
            if input == "exit" || input == "quit" {
                break;
            }

            let result = run_task(&agent, &scope, &args.session, input).await;
            println!("\n◆ {}\n", result.outcome.user_message());
        }
    }

    agent.executor().shutdown();
    Ok(())
}

/// List the actions a caller can see
pub async fn plugins_list_command(user: Option<String>) -> Result<()> {
    let config = Config::load().await?;
    let scope = scope_for(user);
    let registry = open_registry(&config, &scope).await?;

    let actions = registry.catalog_for(&scope);
    if actions.is_empty() {
        println!("No actions available");
        return Ok(());
    }

    println!("Actions for {}:", scope);
    for action in actions {
        let trigger = if action.is_pre_request() {
            " [pre_request]"
        } else {
            ""
        };
        println!(
            "  {} ({}){} - {}",
            action.name, action.plugin_id, trigger, action.description
        );
    }
    Ok(())
}

fn print_names(label: &str, names: &[String]) {
    if !names.is_empty() {
        println!("  {}: {}", label, names.join(", "));
    }
}

/// Re-scan plugin directories
pub async fn plugins_reload_command(user: Option<String>) -> Result<()> {
    let config = Config::load().await?;
    let registry = PluginRegistry::from_config(&config);

    let mut scopes = vec![Scope::System];
    if let Some(user) = user {
        scopes.push(Scope::user(user));
    }

    for scope in scopes {
        let report = registry.reload(&scope).await?;
        println!("◆ {}", scope);
        print_names("added", &report.added);
        print_names("updated", &report.updated);
        print_names("removed", &report.removed);
        for rejected in &report.rejected {
            println!("  ✗ {}: {}", rejected.path.display(), rejected.reason);
        }
    }
    Ok(())
}

/// Uninstall a plugin from its scope directory
pub async fn plugins_remove_command(id: String, user: Option<String>) -> Result<()> {
    let config = Config::load().await?;
    let scope = scope_for(user);
    let registry = open_registry(&config, &scope).await?;

    let removed = registry.uninstall(&scope, &id).await?;
    println!("✓ Removed {} {} from {}", removed.id, removed.version, scope);
    Ok(())
}

/// Install a plugin bundle
pub async fn plugins_install_command(path: PathBuf, user: Option<String>) -> Result<()> {
    let config = Config::load().await?;
    let scope = scope_for(user);
    let registry = open_registry(&config, &scope).await?;

    let installed = registry
        .install(&scope, &path)
        .await
        .with_context(|| format!("failed to install {}", path.display()))?;
    let actions: Vec<&str> = installed.action_names().collect();
    println!(
        "✓ Installed {} {} into {} ({})",
        installed.id,
        installed.version,
        scope,
        actions.join(", ")
    );
    Ok(())
}

/// Export a plugin as a signed bundle
pub async fn plugins_export_command(id: String, dest: PathBuf, user: Option<String>) -> Result<()> {
    let config = Config::load().await?;
    let scope = scope_for(user);
    let registry = open_registry(&config, &scope).await?;

    let bundle = registry.export(&scope, &id, &dest).await?;
    println!("✓ Exported {} to {}", id, bundle.display());
    Ok(())
}

/// Run a single action outside the agent loop
pub async fn plugins_run_command(name: String, args: String, user: Option<String>) -> Result<()> {
    let config = Config::load().await?;
    let scope = scope_for(user);
    let registry = open_registry(&config, &scope).await?;
    let executor = ActionExecutor::from_config(&config);

    let arguments: Value =
        serde_json::from_str(&args).context("--args must be a JSON object")?;
    let request = ActionRequest::new(name.clone(), scope, arguments);

    let cancel = CancellationToken::new();
    let result = tokio::select! {
        result = executor.run(&registry, &request, config.action_timeout(), &cancel) => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("interrupted");
        }
    };

    println!("{}", describe_result(&name, &result));
    if !result.is_success() {
        anyhow::bail!("action '{}' did not succeed", name);
    }
    Ok(())
}

/// Show status
pub async fn status_command() -> Result<()> {
    let config_path = genesis_config::config_path();

    println!("◆ Genesis System Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_path.exists() {
            "[OK]"
        } else {
            "[Missing]"
        }
    );

    if !config_path.exists() {
        println!("\nRun `genesis init` first");
        return Ok(());
    }

    let config = Config::load().await?;
    let system_dir = config.system_plugins_dir();
    println!(
        "Plugins:   {} {}",
        system_dir.display(),
        if system_dir.exists() {
            "[OK]"
        } else {
            "[Missing]"
        }
    );
    println!("Model:     {}", config.default_model());
    println!(
        "API Key:   {}",
        if config.has_api_key() {
            "[Set]"
        } else {
            "[Missing]"
        }
    );
    println!("Max steps: {}", config.max_steps());
    println!(
        "Timeouts:  provider {}s, action {}s, task {}s",
        config.provider_timeout().as_secs(),
        config.action_timeout().as_secs(),
        config.max_wall_clock().as_secs()
    );

    let registry = PluginRegistry::from_config(&config);
    let discovered = registry.discover().await?;
    let rejected: usize = discovered.iter().map(|(_, r)| r.rejected.len()).sum();
    let catalog = registry.snapshot();
    println!(
        "Catalog:   {} system plugins, {} users, {} rejected",
        catalog.plugins(&Scope::System).len(),
        catalog.users().count(),
        rejected
    );

    println!("\n◆ Ready");

    Ok(())
}

const HELLO_MANIFEST: &str = r#"{
  "id": "hello_world",
  "name": "Hello World",
  "version": "1.0.0",
  "description": "Sample plugin installed by genesis init",
  "actions": [
    {
      "name": "hello",
      "type": "process",
      "script": "hello.sh",
      "interpreter": "sh",
      "description": "Greet someone by name",
      "parameters": {
        "target": "string: who to greet"
      }
    }
  ]
}
"#;

const HELLO_SCRIPT: &str = r#"#!/bin/sh
# Reads {"target": "..."} on stdin and greets it.
input=$(cat)
target=$(printf '%s' "$input" | sed -n 's/.*"target"[[:space:]]*:[[:space:]]*"\([^"]*\)".*/\1/p')
[ -z "$target" ] && target="World"
printf '{"status":"success","message":"Hello, %s!"}\n' "$target"
"#;
