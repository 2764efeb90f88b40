use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forge_studio::config::StudioConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "studio")]
#[command(version, about = "Plan, generate, preview and repair web projects")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true, env = "STUDIO_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "3140")]
        port: u16,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Produce a plan for a session and wait for approval
    Plan {
        session: String,
        prompt: String,
        #[arg(short, long, default_value = "nextjs")]
        framework: String,
    },
    /// Approve the pending plan and implement it step by step
    Approve { session: String },
    /// Apply a change directly, without a plan
    Fast {
        session: String,
        message: String,
        #[arg(short, long, default_value = "nextjs")]
        framework: String,
    },
    /// Build the project and repair what fails
    Repair {
        session: String,
        #[arg(short, long)]
        framework: Option<String>,
    },
    /// Return a session to idle
    Reset { session: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default studio.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, command.clone());
    }

    let config = StudioConfig::with_cli_args(project_dir, cli.verbose, cli.json_logs)?;
    let log_dir = config.toml.logging.file.then(|| config.log_dir());
    let _guard = forge_studio::logging::init(config.verbose, config.json_logs(), log_dir.as_deref());
    for warning in config.validate() {
        tracing::warn!(%warning, "configuration");
    }

    match &cli.command {
        Commands::Serve { port, dev } => cmd::cmd_serve(&config, *port, *dev).await?,
        Commands::Plan {
            session,
            prompt,
            framework,
        } => cmd::cmd_plan(&config, session, prompt, framework).await?,
        Commands::Approve { session } => cmd::cmd_approve(&config, session).await?,
        Commands::Fast {
            session,
            message,
            framework,
        } => cmd::cmd_fast(&config, session, message, framework).await?,
        Commands::Repair { session, framework } => {
            cmd::cmd_repair(&config, session, framework.as_deref()).await?
        }
        Commands::Reset { session } => cmd::cmd_reset(&config, session).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
