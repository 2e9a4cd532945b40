//! `codeloop drive`: the Driver process itself.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::error;

use codeloop::config::Settings;
use codeloop::driver::background::{format_bootstrap, spawn_detached};
use codeloop::driver::emit::Emitter;
use codeloop::driver::exec::ProcessRunner;
use codeloop::driver::{Pipeline, RunRequest};

pub struct DriveArgs {
    pub run_id: Option<String>,
    pub repo: PathBuf,
    pub prompt: String,
    pub skip_pr: bool,
    pub skip_plan: bool,
    pub background: bool,
    pub log_file: Option<PathBuf>,
}

/// Run the pipeline and return the process exit code.
pub fn cmd_drive(settings: &Settings, args: DriveArgs) -> Result<i32> {
    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if args.background {
        let log_file = args
            .log_file
            .clone()
            .unwrap_or_else(|| settings.run_log_file(&run_id));
        let child_args = detached_args(std::env::args().skip(1), &run_id);
        let pid = spawn_detached(&child_args, &log_file)?;
        println!("{}", format_bootstrap(pid, &log_file));
        return Ok(0);
    }

    let request = RunRequest {
        run_id,
        repo_path: args.repo,
        prompt: args.prompt,
        skip_pr: args.skip_pr || settings.general.skip_pr,
        skip_plan: args.skip_plan || settings.general.skip_plan,
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let runner = ProcessRunner;
    let pipeline = Pipeline::new(&runner, settings, Emitter::stdout());
    match runtime.block_on(pipeline.run(&request)) {
        Ok(_) => Ok(0),
        Err(e) => {
            error!(run_id = %request.run_id, error = %e, "run failed");
            Ok(e.exit_code())
        }
    }
}

/// The current arguments minus `--background`, with the run id pinned so
/// the detached child reports under the id the launcher announced.
fn detached_args(args: impl Iterator<Item = String>, run_id: &str) -> Vec<String> {
    let mut out: Vec<String> = args.filter(|a| a != "--background").collect();
    let has_id = out
        .iter()
        .any(|a| a == "--run-id" || a.starts_with("--run-id="));
    if !has_id {
        out.push(format!("--run-id={}", run_id));
    }
    out
}
