//! `codeloop config`: view, validate and initialize configuration.

use anyhow::{Context, Result};

use codeloop::config::Settings;

use crate::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, settings: &Settings, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(|| settings.config_path());

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("codeloop configuration");
            println!("======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
            }
            println!("State directory: {}", settings.state_dir.display());
            println!("Workspace root: {}", settings.workspace_root().display());
            println!();
            println!("Effective values (with env overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(settings).context("Failed to render configuration")?;
            print!("{}", rendered);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }

            let file = Settings::load(&config_path)?;
            let warnings = file.validate();
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
                println!("config.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            Settings::default().save(&config_path)?;

            println!("Created config.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [general] workspace_root, branch_prefix, skip_pr, notifications");
            println!("  - [models] one model per agent phase");
            println!("  - [setup] commands run in each fresh workspace");
            println!();
        }
    }

    Ok(())
}
