//! Genesis - local agent runtime

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{
    engage_command, init_command, plugins_export_command, plugins_install_command,
    plugins_list_command, plugins_reload_command, plugins_remove_command, plugins_run_command,
    status_command, EngageArgs,
};

/// Genesis - an agent that reasons and runs plugin actions
#[derive(Parser)]
#[command(name = "genesis")]
#[command(about = "A local agent runtime driving sandboxed plugin actions")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config and data directories
    Init,
    /// Run a task through the agent
    Engage {
        /// Task to run; omit for interactive mode
        #[arg(short, long)]
        message: Option<String>,
        /// Act on behalf of this user
        #[arg(short, long)]
        user: Option<String>,
        /// Session ID for stored history
        #[arg(short, long, default_value = "default")]
        session: String,
        /// Override the configured step budget
        #[arg(long)]
        max_steps: Option<u32>,
    },
    /// Manage plugins
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Show system status
    Status,
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List the actions visible to a caller
    List {
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Re-scan plugin directories and report changes
    Reload {
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Uninstall a plugin
    Remove {
        id: String,
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Install a plugin bundle directory
    Install {
        path: PathBuf,
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Export a plugin as a signed bundle
    Export {
        id: String,
        /// Directory that receives `<id>/`
        dest: PathBuf,
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Run one action directly
    Run {
        name: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
        #[arg(short, long)]
        user: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Init => init_command().await,
        Commands::Engage {
            message,
            user,
            session,
            max_steps,
        } => {
            engage_command(EngageArgs {
                message,
                user,
                session,
                max_steps,
            })
            .await
        }
        Commands::Plugins { command } => match command {
            PluginCommands::List { user } => plugins_list_command(user).await,
            PluginCommands::Reload { user } => plugins_reload_command(user).await,
            PluginCommands::Remove { id, user } => plugins_remove_command(id, user).await,
            PluginCommands::Install { path, user } => plugins_install_command(path, user).await,
            PluginCommands::Export { id, dest, user } => {
                plugins_export_command(id, dest, user).await
            }
            PluginCommands::Run { name, args, user } => {
                plugins_run_command(name, args, user).await
            }
        },
        Commands::Status => status_command().await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
