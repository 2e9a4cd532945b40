//! `codeloop start`: create a run and supervise it from this process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

use codeloop::config::Settings;
use codeloop::registry::RunEvent;
use codeloop::run::{ExecutionMode, RunStatus};
use codeloop::supervisor::{AdoptMode, LaunchRequest};

use super::{host, print_entry, print_summary, require_registry, short_id};
use crate::Cli;

pub struct StartArgs {
    pub prompt: String,
    pub repo: PathBuf,
    pub background: bool,
    pub follow: bool,
    pub auto_merge: bool,
    pub skip_pr: bool,
    pub skip_plan: bool,
}

pub async fn cmd_start(cli: &Cli, settings: Settings, args: StartArgs) -> Result<()> {
    let settings = Arc::new(settings);
    let registry = require_registry(&settings)?;
    let supervisor = host(cli, settings.clone(), registry.clone())?;
    supervisor.adopt_orphans(AdoptMode::Tail).await;

    let mode = if args.background {
        ExecutionMode::Background
    } else {
        ExecutionMode::Foreground
    };
    let mut events = registry.subscribe();
    let run = supervisor
        .start(LaunchRequest {
            repo_path: args.repo,
            prompt: args.prompt,
            mode,
            auto_merge: args.auto_merge,
            skip_pr: args.skip_pr || settings.general.skip_pr,
            skip_plan: args.skip_plan || settings.general.skip_plan,
        })
        .await?;
    println!("Started run {} ({})", short_id(&run.id), mode.as_str());

    if args.background && !args.follow {
        if let (Some(pid), Some(log)) = (run.pid, &run.log_file) {
            println!("  pid: {}", pid);
            println!("  log: {}", log.display());
        }
        supervisor.wait_followups().await;
        registry.flush().await?;
        return Ok(());
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RunEvent::Log { run_id, entry }) if run_id == run.id => print_entry(&entry),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "log display fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = supervisor.wait(&run.id) => break,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopping run {}...", short_id(&run.id));
                supervisor.stop(&run.id).await?;
            }
        }
    }
    loop {
        match events.try_recv() {
            Ok(RunEvent::Log { run_id, entry }) if run_id == run.id => print_entry(&entry),
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    supervisor.wait_followups().await;
    registry.flush().await?;

    let Some(finished) = registry.get(&run.id) else {
        return Ok(());
    };
    println!();
    print_summary(&finished);
    if finished.status == RunStatus::Failed {
        bail!(
            "Run {} failed: {}",
            short_id(&finished.id),
            finished.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
