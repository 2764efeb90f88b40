//! Configuration view and validation commands: `studio config`.

use anyhow::Result;

use forge_studio::config::{CONFIG_FILE, STUDIO_DIR, StudioConfig, StudioToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let studio_dir = project_dir.join(STUDIO_DIR);
    let config_path = studio_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Studio Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No studio.toml found at {}", config_path.display());
                println!("Using default configuration:");
            }
            println!();

            let config = StudioConfig::new(project_dir.to_path_buf())?;
            let toml = &config.toml;
            println!("[generation]");
            println!("  claude_cmd = \"{}\"", toml.generation.claude_cmd);
            println!("  max_retries = {}", toml.generation.max_retries);
            println!("  retry_backoff_ms = {}", toml.generation.retry_backoff_ms);
            println!();
            println!("[workspace]");
            println!("  root = \"{}\"", config.workspaces_dir().display());
            println!("  command_timeout_secs = {}", toml.workspace.command_timeout_secs);
            println!(
                "  max_concurrent_commands = {}",
                toml.workspace.max_concurrent_commands
            );
            println!();
            println!("[preview]");
            println!("  max_processes = {}", toml.preview.max_processes);
            println!(
                "  ports = {}..{}",
                toml.preview.base_port,
                u32::from(toml.preview.base_port) + u32::from(toml.preview.port_window)
            );
            println!("  ready_timeout_secs = {}", toml.preview.ready_timeout_secs);
            println!("  idle_timeout_secs = {}", toml.preview.idle_timeout_secs);
            for (name, o) in &toml.preview.frameworks {
                println!("  [preview.frameworks.{}]", name);
                for (key, value) in [
                    ("install", &o.install),
                    ("dev", &o.dev),
                    ("build", &o.build),
                    ("ready_pattern", &o.ready_pattern),
                ] {
                    if let Some(value) = value {
                        println!("    {} = \"{}\"", key, value);
                    }
                }
            }
            println!();
            println!("[diagnostics]");
            println!("  runtime_capacity = {}", toml.diagnostics.runtime_capacity);
            println!("  settle_ms = {}", toml.diagnostics.settle_ms);
            println!();
            println!("[logging]");
            println!("  json = {}", toml.logging.json);
            println!("  file = {}", toml.logging.file);
            println!();
            if !config_path.exists() {
                println!("Run 'studio config init' to create a studio.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No studio.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = StudioToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("studio.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&studio_dir)?;
            StudioToml::default().save(&config_path)?;

            println!("Created studio.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [generation] claude_cmd, max_retries");
            println!("  - [preview] max_processes, base_port, port_window");
            println!("  - [preview.frameworks.nextjs] install, dev, build, ready_pattern");
            println!();
        }
    }

    Ok(())
}
