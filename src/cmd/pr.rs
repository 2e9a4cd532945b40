//! `codeloop pr`: manual mergeability refresh, merge and conflict resolution.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;

use codeloop::config::Settings;
use codeloop::run::{MergeStatus, PrState};

use super::{pr_manager, require_registry, short_id};
use crate::PrCommands;

pub async fn cmd_pr(settings: Settings, command: PrCommands) -> Result<()> {
    let settings = Arc::new(settings);
    let registry = require_registry(&settings)?;
    let manager = pr_manager(&registry, &settings);

    let id = match &command {
        PrCommands::Refresh { id } | PrCommands::Merge { id } | PrCommands::Resolve { id } => id,
    };
    let run = registry
        .find(id)
        .with_context(|| format!("No run matches '{}'", id))?;

    let result = match command {
        PrCommands::Refresh { .. } => manager.refresh(&run.id).await,
        PrCommands::Merge { .. } => manager.merge(&run.id).await,
        PrCommands::Resolve { .. } => {
            println!("Resolving conflicts for run {}...", short_id(&run.id));
            manager.resolve_and_merge(&run.id).await
        }
    };
    registry.flush().await?;
    let state = result?;
    print_state(&state);
    if state.merge_status == MergeStatus::Failed {
        anyhow::bail!(
            "{}",
            state.message.as_deref().unwrap_or("pull request failed")
        );
    }
    Ok(())
}

fn print_state(state: &PrState) {
    let status = state.merge_status.as_str();
    let status = match state.merge_status {
        MergeStatus::Merged | MergeStatus::Ready => style(status).green(),
        MergeStatus::Conflict | MergeStatus::Failed => style(status).red(),
        _ => style(status).cyan(),
    };
    println!("{} {}", style(&state.url).bold(), status);
    if let Some(title) = &state.title {
        println!("  {}", title);
    }
    if let Some(message) = &state.message {
        println!("  {}", style(message).dim());
    }
}
