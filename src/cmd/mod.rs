//! CLI command implementations.
//!
//! | Module   | Commands handled   |
//! |----------|--------------------|
//! | `drive`  | `Drive`            |
//! | `start`  | `Start`            |
//! | `runs`   | `Runs`             |
//! | `pr`     | `Pr`               |
//! | `config` | `Config`           |

pub mod config;
pub mod drive;
pub mod pr;
pub mod runs;
pub mod start;

pub use config::cmd_config;
pub use drive::cmd_drive;
pub use pr::cmd_pr;
pub use runs::cmd_runs;
pub use start::cmd_start;

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use codeloop::config::Settings;
use codeloop::driver::exec::ProcessRunner;
use codeloop::errors::RegistryError;
use codeloop::pr::PrManager;
use codeloop::registry::RunRegistry;
use codeloop::run::{LogEntry, Run, RunStatus};
use codeloop::supervisor::{DriverCommand, Supervisor};

use super::{Cli, Commands};

/// stderr plus a daily file under `<state>/logs`. The driver keeps stderr
/// quiet because its stderr is part of the run's log stream.
pub fn init_tracing(cli: &Cli, settings: &Settings) -> Option<WorkerGuard> {
    let driving = matches!(cli.command, Commands::Drive { .. });
    let default = match (cli.verbose, driving) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    };
    let filter = || {
        EnvFilter::try_from_env("CODELOOP_LOG").unwrap_or_else(|_| EnvFilter::new(default))
    };

    let (file_layer, guard) = match std::fs::create_dir_all(settings.log_dir()) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(settings.log_dir(), "codeloop.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(filter()),
        )
        .with(file_layer)
        .try_init();
    guard
}

/// Flags a launched driver needs to see the same state and config.
pub fn global_args(cli: &Cli, settings: &Settings) -> Vec<String> {
    let mut args = vec![
        "--state-dir".to_string(),
        settings.state_dir.display().to_string(),
    ];
    if let Some(config) = &cli.config {
        args.push("--config".to_string());
        args.push(config.display().to_string());
    }
    if cli.verbose {
        args.push("--verbose".to_string());
    }
    args
}

/// Take ownership of the registry, or `None` when another host holds it.
pub fn open_registry(settings: &Settings) -> Result<Option<Arc<RunRegistry>>> {
    match RunRegistry::open(&settings.registry_path(), settings.timing.persist_debounce()) {
        Ok(registry) => Ok(Some(registry)),
        Err(RegistryError::Locked { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Registry for commands that mutate runs; refuses to share with another host.
pub fn require_registry(settings: &Settings) -> Result<Arc<RunRegistry>> {
    open_registry(settings)?.with_context(|| {
        format!(
            "Another codeloop process owns {}; stop it or use read-only commands",
            settings.registry_path().display()
        )
    })
}

pub fn pr_manager(registry: &Arc<RunRegistry>, settings: &Arc<Settings>) -> Arc<PrManager> {
    Arc::new(PrManager::new(
        Arc::new(ProcessRunner),
        registry.clone(),
        settings.clone(),
    ))
}

/// Supervisor wired to this binary's `drive` subcommand and the PR manager.
pub fn host(cli: &Cli, settings: Arc<Settings>, registry: Arc<RunRegistry>) -> Result<Arc<Supervisor>> {
    let driver = DriverCommand::current_exe(global_args(cli, &settings))
        .context("Failed to resolve codeloop executable")?;
    let pr = pr_manager(&registry, &settings);
    Ok(Arc::new(
        Supervisor::new(registry, settings, driver).with_pr_manager(pr),
    ))
}

pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn styled_status(status: RunStatus) -> String {
    let text = status.as_str();
    match status {
        RunStatus::Running => style(text).cyan().to_string(),
        RunStatus::Completed => style(text).green().to_string(),
        RunStatus::Failed => style(text).red().to_string(),
        RunStatus::Stopped => style(text).yellow().to_string(),
    }
}

pub fn print_entry(entry: &LogEntry) {
    if entry.is_structured() {
        println!(
            "{} {} {}",
            style(&entry.timestamp).dim(),
            style(format!("[{}]", entry.phase_tag)).bold(),
            entry.message
        );
    } else {
        println!("{}", style(&entry.message).dim());
    }
}

pub fn print_summary(run: &Run) {
    println!(
        "Run {} {}",
        style(short_id(&run.id)).bold(),
        styled_status(run.status)
    );
    if let Some(branch) = &run.branch_name {
        println!("  branch: {}", branch);
    }
    if let Some(pr) = &run.pr {
        println!("  pull request: {} ({})", pr.url, pr.merge_status.as_str());
    }
    if let Some(error) = &run.error {
        println!("  error: {}", style(error).red());
    }
}
