//! `codeloop runs`: list, inspect, follow and stop runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use tokio::sync::broadcast::error::RecvError;

use codeloop::config::Settings;
use codeloop::phase::{ALL_PHASES, PhaseStatus};
use codeloop::registry::{RunEvent, RunRegistry, find_by_prefix};
use codeloop::run::{LogEntry, Run, RunStatus};
use codeloop::supervisor::AdoptMode;

use super::{host, open_registry, print_entry, print_summary, require_registry, short_id, styled_status};
use crate::{Cli, RunsCommands};

pub async fn cmd_runs(cli: &Cli, settings: Settings, command: RunsCommands) -> Result<()> {
    let settings = Arc::new(settings);
    match command {
        RunsCommands::List { status } => {
            let status = status
                .map(|s| s.parse::<RunStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let runs = current_runs(cli, &settings).await?;
            let runs: Vec<Run> = runs
                .into_iter()
                .filter(|r| status.is_none_or(|s| r.status == s))
                .collect();
            if runs.is_empty() {
                println!("No runs recorded.");
                return Ok(());
            }
            for run in &runs {
                print_row(run);
            }
        }
        RunsCommands::Show { id } => {
            let run = find(&current_runs(cli, &settings).await?, &id)?;
            print_details(&run);
        }
        RunsCommands::Logs { id, follow } => {
            if follow {
                follow_logs(cli, &settings, &id).await?;
            } else {
                let run = find(&current_runs(cli, &settings).await?, &id)?;
                run.logs.iter().for_each(print_entry);
            }
        }
        RunsCommands::Stop { id } => {
            let registry = require_registry(&settings)?;
            let supervisor = host(cli, settings.clone(), registry.clone())?;
            supervisor.adopt_orphans(AdoptMode::CatchUp).await;
            let run = supervisor.stop(&id).await?;
            supervisor.wait_followups().await;
            registry.flush().await?;
            print_summary(&run);
        }
    }
    Ok(())
}

/// Reconciled runs when this process can own the registry, otherwise the
/// last snapshot written by whoever does.
async fn current_runs(cli: &Cli, settings: &Arc<Settings>) -> Result<Vec<Run>> {
    match open_registry(settings)? {
        Some(registry) => {
            let supervisor = host(cli, settings.clone(), registry.clone())?;
            supervisor.adopt_orphans(AdoptMode::CatchUp).await;
            supervisor.wait_followups().await;
            registry.flush().await?;
            Ok(registry.list())
        }
        None => Ok(RunRegistry::read_snapshot(&settings.registry_path())?),
    }
}

fn find(runs: &[Run], id: &str) -> Result<Run> {
    runs.iter()
        .find(|r| r.id == id)
        .cloned()
        .or_else(|| find_by_prefix(runs.to_vec(), id))
        .with_context(|| format!("No run matches '{}'", id))
}

fn print_row(run: &Run) {
    let phase = run
        .current_phase
        .map(|p| p.tag().to_lowercase())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<20}  {:<10}  {}  {}",
        style(short_id(&run.id)).bold(),
        styled_status(run.status),
        phase,
        run.created_at.format("%Y-%m-%d %H:%M"),
        codeloop::util::first_line(&run.prompt, 60)
    );
}

fn print_details(run: &Run) {
    print_summary(run);
    println!("  id: {}", run.id);
    println!("  repo: {}", run.repo_path.display());
    println!("  mode: {}", run.mode.as_str());
    println!("  task: {}", codeloop::util::first_line(&run.prompt, 120));
    if let Some(pid) = run.pid {
        println!("  pid: {}", pid);
    }
    if let Some(log) = &run.log_file {
        println!("  log: {}", log.display());
    }
    if let Some(secs) = run.total_duration_secs {
        println!("  duration: {}s", secs);
    }
    println!();
    for phase in ALL_PHASES {
        let status = run.phases.get(phase);
        let label = match status {
            PhaseStatus::Completed => style(status.as_str()).green(),
            PhaseStatus::Active => style(status.as_str()).cyan(),
            PhaseStatus::Failed => style(status.as_str()).red(),
            PhaseStatus::Skipped => style(status.as_str()).dim(),
            PhaseStatus::Pending => style(status.as_str()),
        };
        println!("  {:<10} {}", phase.tag(), label);
    }
    if let Some(pr) = &run.pr {
        println!();
        println!("  pull request: {}", pr.url);
        if let Some(title) = &pr.title {
            println!("  title: {}", title);
        }
        println!("  merge status: {}", pr.merge_status.as_str());
        if let Some(message) = &pr.message {
            println!("  {}", style(message).dim());
        }
    }
}

async fn follow_logs(cli: &Cli, settings: &Arc<Settings>, id: &str) -> Result<()> {
    let Some(registry) = open_registry(settings)? else {
        return poll_snapshot(settings, id).await;
    };
    let supervisor = host(cli, settings.clone(), registry.clone())?;
    let mut events = registry.subscribe();
    let run = find(&registry.list(), id)?;
    run.logs.iter().for_each(print_entry);
    supervisor.adopt_orphans(AdoptMode::Tail).await;

    if supervisor.is_active(&run.id) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(RunEvent::Log { run_id, entry }) if run_id == run.id => print_entry(&entry),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                _ = supervisor.wait(&run.id) => break,
            }
        }
    }
    supervisor.wait_followups().await;
    registry.flush().await?;
    if let Some(run) = registry.get(&run.id) {
        println!();
        print_summary(&run);
    }
    Ok(())
}

/// Follow through the registry file another process keeps writing.
async fn poll_snapshot(settings: &Settings, id: &str) -> Result<()> {
    let mut last: Option<LogEntry> = None;
    loop {
        let runs = RunRegistry::read_snapshot(&settings.registry_path())?;
        let run = find(&runs, id)?;
        let start = last
            .as_ref()
            .and_then(|seen| run.logs.iter().rposition(|e| e == seen))
            .map_or(0, |i| i + 1);
        for entry in run.logs.iter().skip(start) {
            print_entry(entry);
        }
        if let Some(entry) = run.logs.back() {
            last = Some(entry.clone());
        }
        if run.status.is_terminal() {
            println!();
            print_summary(&run);
            return Ok(());
        }
        tokio::time::sleep(settings.timing.tail_interval()).await;
    }
}
