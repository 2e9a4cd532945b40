use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "codeloop")]
#[command(version, about = "AI-assisted change-submission pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding runs.json, run logs and workspaces (default ~/.codeloop)
    #[arg(long, global = true, env = "CODELOOP_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Config file (default <state-dir>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute the pipeline for one run (launched by the supervisor)
    Drive {
        /// Run id to report under (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,
        /// Local repository whose origin is cloned
        #[arg(long)]
        repo: PathBuf,
        /// Task for the agent
        #[arg(long, allow_hyphen_values = true)]
        prompt: String,
        #[arg(long)]
        skip_pr: bool,
        #[arg(long)]
        skip_plan: bool,
        /// Detach, print the bootstrap line and exit
        #[arg(long)]
        background: bool,
        /// Log file for --background
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Create a run and supervise its driver
    Start {
        /// Task for the agent
        #[arg(allow_hyphen_values = true)]
        prompt: String,
        /// Local repository (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,
        /// Detach the driver and return immediately
        #[arg(short, long)]
        background: bool,
        /// With --background, keep tailing until the run finishes
        #[arg(short, long, requires = "background")]
        follow: bool,
        /// Merge the pull request once the run completes and it is mergeable
        #[arg(long)]
        auto_merge: bool,
        #[arg(long)]
        skip_pr: bool,
        #[arg(long)]
        skip_plan: bool,
    },
    /// Inspect and control recorded runs
    Runs {
        #[command(subcommand)]
        command: RunsCommands,
    },
    /// Drive a run's pull request
    Pr {
        #[command(subcommand)]
        command: PrCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum RunsCommands {
    /// List runs, newest last
    List {
        /// Only runs with this status (running, completed, failed, stopped)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one run's phases and pull request
    Show { id: String },
    /// Print a run's log entries
    Logs {
        id: String,
        /// Keep printing new entries until the run finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Stop a running run
    Stop { id: String },
}

#[derive(Subcommand, Clone)]
pub enum PrCommands {
    /// Re-query mergeability
    Refresh { id: String },
    /// Merge the pull request
    Merge { id: String },
    /// Resolve conflicts in a temporary clone, push and merge
    Resolve { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default config.toml
    Init,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings =
        codeloop::config::Settings::resolve(cli.config.as_deref(), cli.state_dir.as_deref())?;
    let guard = cmd::init_tracing(&cli, &settings);

    let result = match &cli.command {
        Commands::Drive {
            run_id,
            repo,
            prompt,
            skip_pr,
            skip_plan,
            background,
            log_file,
        } => {
            let args = cmd::drive::DriveArgs {
                run_id: run_id.clone(),
                repo: repo.clone(),
                prompt: prompt.clone(),
                skip_pr: *skip_pr,
                skip_plan: *skip_plan,
                background: *background,
                log_file: log_file.clone(),
            };
            cmd::cmd_drive(&settings, args)
        }
        Commands::Config { command } => {
            cmd::cmd_config(&cli, &settings, command.clone()).map(|_| 0)
        }
        command => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(async {
                match command {
                    Commands::Start {
                        prompt,
                        repo,
                        background,
                        follow,
                        auto_merge,
                        skip_pr,
                        skip_plan,
                    } => {
                        let repo = match repo {
                            Some(repo) => repo.clone(),
                            None => std::env::current_dir()
                                .context("Failed to get current directory")?,
                        };
                        let args = cmd::start::StartArgs {
                            prompt: prompt.clone(),
                            repo,
                            background: *background,
                            follow: *follow,
                            auto_merge: *auto_merge,
                            skip_pr: *skip_pr,
                            skip_plan: *skip_plan,
                        };
                        cmd::cmd_start(&cli, settings, args).await
                    }
                    Commands::Runs { command } => {
                        cmd::cmd_runs(&cli, settings, command.clone()).await
                    }
                    Commands::Pr { command } => cmd::cmd_pr(settings, command.clone()).await,
                    Commands::Drive { .. } | Commands::Config { .. } => Ok(()),
                }
            })
            .map(|_| 0)
        }
    };
    // Flush file logging before a non-zero driver exit skips destructors.
    drop(guard);
    let code = result?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
