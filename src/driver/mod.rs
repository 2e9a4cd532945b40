//! Pipeline Driver: one task, one branch, one pull request.
//!
//! Runs the nine phases strictly in order inside a fresh clone and reports
//! every event as a structured line on stdout (see [`emit`]). A failing phase
//! prints `Failed: <reason>` under its own tag and aborts the rest. Nothing is
//! rolled back.

pub mod agent;
pub mod background;
pub mod emit;
pub mod exec;
pub mod retry;
pub mod text;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::errors::DriverError;
use crate::phase::Phase;
use crate::util::{extract_pr_url, first_line, truncate_chars};
use agent::{AgentMode, agent_command};
use emit::Emitter;
use exec::{CommandOutput, CommandRunner, CommandSpec};
use retry::{RetryPolicy, run_with_retry};

/// Longest failure reason printed on a `Failed:` line.
const MAX_REASON_CHARS: usize = 500;

/// Inputs for one Driver invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub repo_path: PathBuf,
    pub prompt: String,
    pub skip_pr: bool,
    pub skip_plan: bool,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub branch: String,
    pub workspace: PathBuf,
    pub pr_url: Option<String>,
    pub total_secs: u64,
}

/// Per-run workspace established by the Clone phase.
#[derive(Debug, Clone)]
struct Workspace {
    dir: PathBuf,
    base: String,
    branch: String,
}

pub struct Pipeline<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
    emitter: Emitter,
    retry: RetryPolicy,
}

impl<'a> Pipeline<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings, emitter: Emitter) -> Self {
        Self {
            runner,
            settings,
            emitter,
            retry: RetryPolicy::from_config(&settings.retry),
        }
    }

    /// Execute every phase. Validation failures are reported under `CLONE`
    /// before anything on disk changes.
    pub async fn run(&self, request: &RunRequest) -> Result<PipelineOutcome, DriverError> {
        let started = Instant::now();
        info!(run_id = %request.run_id, repo = %request.repo_path.display(), "driver starting");

        let origin = match self.validate(request).await {
            Ok(origin) => origin,
            Err(e) => {
                self.emit_failure(Phase::Clone, &e);
                return Err(e);
            }
        };

        let ws = self
            .timed(
                Phase::Clone,
                "Cloning repository",
                self.clone_phase(request, &origin),
            )
            .await?;

        self.timed(Phase::Setup, "Preparing workspace", self.setup(&ws))
            .await?;

        let plan = if request.skip_plan {
            self.emitter.phase(Phase::Plan, "Skipped: planning disabled");
            None
        } else {
            Some(
                self.timed(Phase::Plan, "Planning", self.plan(&ws, request))
                    .await?,
            )
        };

        self.timed(
            Phase::Implement,
            "Implementing",
            self.implement(&ws, request, plan.as_deref()),
        )
        .await?;

        let review = self
            .timed(Phase::Review, "Reviewing changes", self.review(&ws, request))
            .await?;

        if text::is_lgtm(&review) {
            self.emitter.phase(Phase::Fix, "Skipped: review returned LGTM");
        } else {
            self.timed(Phase::Fix, "Applying review feedback", self.fix(&ws, &review))
                .await?;
        }

        self.timed(Phase::Commit, "Committing changes", self.commit(&ws))
            .await?;

        let pr_url = if request.skip_pr {
            self.emitter.phase(Phase::Push, "Skipped: PR creation disabled");
            self.emitter.phase(Phase::Pr, "Skipped: PR creation disabled");
            None
        } else {
            self.timed(Phase::Push, "Pushing branch", self.push(&ws))
                .await?;
            Some(
                self.timed(Phase::Pr, "Opening pull request", self.open_pr(&ws, request))
                    .await?,
            )
        };

        let total_secs = started.elapsed().as_secs();
        self.emitter.done(total_secs);
        info!(run_id = %request.run_id, total_secs, "driver finished");
        Ok(PipelineOutcome {
            branch: ws.branch,
            workspace: ws.dir,
            pr_url,
            total_secs,
        })
    }

    /// Announce `phase`, await it, then report `Completed in Ns` or `Failed:`.
    async fn timed<T, F>(&self, phase: Phase, start_message: &str, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        let start = Instant::now();
        self.emitter.phase(phase, start_message);
        match fut.await {
            Ok(value) => {
                self.emitter.phase(
                    phase,
                    &format!("Completed in {}s", start.elapsed().as_secs()),
                );
                Ok(value)
            }
            Err(e) => {
                self.emit_failure(phase, &e);
                Err(e)
            }
        }
    }

    fn emit_failure(&self, phase: Phase, error: &DriverError) {
        warn!(phase = %phase, error = %error, "phase failed");
        self.emitter.phase(
            phase,
            &format!("Failed: {}", truncate_chars(&error.to_string(), MAX_REASON_CHARS)),
        );
    }

    // ── command helpers ──────────────────────────────────────────────

    fn git<I, S>(&self, cwd: &Path, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.settings.tools.git.clone(), args).cwd(cwd)
    }

    fn gh<I, S>(&self, cwd: &Path, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.settings.tools.gh.clone(), args).cwd(cwd)
    }

    /// Run a network-sensitive command under the retry policy.
    async fn retrying(&self, phase: Phase, spec: &CommandSpec) -> Result<CommandOutput, DriverError> {
        let emitter = self.emitter.clone();
        run_with_retry(self.runner, &self.retry, spec, &mut |notice| {
            emitter.phase(phase, &notice.message())
        })
        .await
    }

    /// Run a local command once; non-zero exit is an error.
    async fn checked(&self, spec: &CommandSpec) -> Result<CommandOutput, DriverError> {
        let output = self.runner.run(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(DriverError::CommandFailed {
                command: spec.short_display(),
                exit_code: output.exit_code,
                output: output.combined(),
            })
        }
    }

    async fn agent(
        &self,
        phase: Phase,
        mode: AgentMode,
        cwd: &Path,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<String, DriverError> {
        let spec = agent_command(self.settings, mode, cwd, prompt, context);
        debug!(mode = mode.as_str(), "invoking agent");
        Ok(self.retrying(phase, &spec).await?.stdout)
    }

    // ── phases ───────────────────────────────────────────────────────

    /// Preflight checks. Returns the repository's origin URL.
    async fn validate(&self, request: &RunRequest) -> Result<String, DriverError> {
        if request.prompt.trim().is_empty() {
            return Err(DriverError::MissingPrompt);
        }
        if !request.repo_path.is_dir() {
            return Err(DriverError::MissingRepository {
                path: request.repo_path.clone(),
            });
        }

        let tools = &self.settings.tools;
        let mut required = vec![tools.git.as_str(), tools.agent.as_str()];
        if !request.skip_pr {
            required.push(tools.gh.as_str());
        }
        for tool in required {
            let spec = CommandSpec::new(tool, ["--version"]).label(format!("version:{}", tool));
            let message = match self.runner.run(&spec).await {
                Ok(output) if output.success() => continue,
                Ok(output) => first_line(&output.combined(), 200),
                Err(e) => e.to_string(),
            };
            return Err(DriverError::MissingTool {
                tool: tool.to_string(),
                message,
            });
        }

        let remote = self
            .runner
            .run(&self.git(&request.repo_path, ["remote", "get-url", "origin"]))
            .await?;
        let origin = remote.stdout.trim().to_string();
        if !remote.success() || origin.is_empty() {
            return Err(DriverError::MissingRemote {
                path: request.repo_path.clone(),
            });
        }
        Ok(origin)
    }

    async fn clone_phase(&self, request: &RunRequest, origin: &str) -> Result<Workspace, DriverError> {
        let root = self.settings.workspace_root();
        let dir = root.join(&request.run_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|source| DriverError::WorkspaceIo {
                path: dir.clone(),
                source,
            })?;
        }
        std::fs::create_dir_all(&root).map_err(|source| DriverError::WorkspaceIo {
            path: root.clone(),
            source,
        })?;
        self.emitter
            .phase(Phase::Clone, &format!("Workspace: {}", dir.display()));

        let target = dir.display().to_string();
        self.retrying(Phase::Clone, &self.git(&root, ["clone", origin, target.as_str()]))
            .await?;

        let base = self.default_branch(&dir, request.skip_pr).await;
        self.emitter
            .phase(Phase::Clone, &format!("Base branch: {}", base));

        let branch = self.branch_name(&dir, &request.prompt).await;
        let start_point = format!("origin/{}", base);
        self.checked(&self.git(&dir, ["checkout", "-b", branch.as_str(), start_point.as_str()]))
            .await?;
        self.emitter
            .phase(Phase::Clone, &format!("Branch: {}", branch));

        Ok(Workspace { dir, base, branch })
    }

    /// Hosting metadata first, then `origin/HEAD`, then `main`.
    async fn default_branch(&self, dir: &Path, skip_hosting: bool) -> String {
        if !skip_hosting {
            let spec = self.gh(
                dir,
                [
                    "repo",
                    "view",
                    "--json",
                    "defaultBranchRef",
                    "--jq",
                    ".defaultBranchRef.name",
                ],
            );
            match self.retrying(Phase::Clone, &spec).await {
                Ok(output) if !output.stdout.trim().is_empty() => {
                    return output.stdout.trim().to_string();
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "default branch lookup via hosting CLI failed"),
            }
        }

        let spec = self.git(dir, ["symbolic-ref", "--short", "refs/remotes/origin/HEAD"]);
        if let Ok(output) = self.runner.run(&spec).await
            && output.success()
        {
            let name = output.stdout.trim();
            let name = name.strip_prefix("origin/").unwrap_or(name);
            if !name.is_empty() {
                return name.to_string();
            }
        }
        "main".to_string()
    }

    async fn branch_name(&self, dir: &Path, prompt: &str) -> String {
        let prefix = &self.settings.general.branch_prefix;
        match self
            .agent(Phase::Clone, AgentMode::BranchSlug, dir, prompt, None)
            .await
        {
            Ok(slug) => {
                text::sanitize_slug(&slug, prefix).unwrap_or_else(|| text::fallback_branch(prefix))
            }
            Err(e) => {
                warn!(error = %e, "branch slug generation failed");
                text::fallback_branch(prefix)
            }
        }
    }

    async fn setup(&self, ws: &Workspace) -> Result<(), DriverError> {
        let commands = &self.settings.setup.commands;
        if commands.is_empty() {
            self.emitter
                .phase(Phase::Setup, "No setup commands configured");
            return Ok(());
        }
        for command in commands {
            self.emitter
                .phase(Phase::Setup, &format!("Running: {}", command));
            let spec = CommandSpec::new("sh", ["-c", command.as_str()])
                .cwd(&ws.dir)
                .label("setup");
            match self.retrying(Phase::Setup, &spec).await {
                Ok(_) => {}
                Err(DriverError::CommandFailed { output, .. })
                | Err(DriverError::RetriesExhausted { output, .. }) => {
                    return Err(DriverError::SetupFailed {
                        command: command.clone(),
                        output: first_line(&output, 200),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn plan(&self, ws: &Workspace, request: &RunRequest) -> Result<String, DriverError> {
        let plan = self
            .agent(Phase::Plan, AgentMode::Plan, &ws.dir, &request.prompt, None)
            .await?;
        if plan.trim().is_empty() {
            return Err(DriverError::EmptyPlan);
        }
        self.emitter.phase(
            Phase::Plan,
            &format!("Plan ready ({} lines)", plan.trim().lines().count()),
        );
        Ok(plan)
    }

    async fn implement(
        &self,
        ws: &Workspace,
        request: &RunRequest,
        plan: Option<&str>,
    ) -> Result<(), DriverError> {
        let context = match plan {
            Some(plan) => format!("Task:\n{}\n\nPlan:\n{}", request.prompt, plan.trim()),
            None => format!("Task:\n{}", request.prompt),
        };
        self.agent(
            Phase::Implement,
            AgentMode::Implement,
            &ws.dir,
            &request.prompt,
            Some(&context),
        )
        .await?;
        Ok(())
    }

    /// Full working diff, with new files marked intent-to-add so they show up.
    async fn working_diff(&self, ws: &Workspace) -> Result<String, DriverError> {
        self.checked(&self.git(&ws.dir, ["add", "-A", "-N"])).await?;
        Ok(self
            .checked(&self.git(&ws.dir, ["diff", "HEAD"]))
            .await?
            .stdout)
    }

    async fn review(&self, ws: &Workspace, request: &RunRequest) -> Result<String, DriverError> {
        let diff = self.working_diff(ws).await?;
        let review = self
            .agent(
                Phase::Review,
                AgentMode::Review,
                &ws.dir,
                &request.prompt,
                Some(&diff),
            )
            .await?;
        let verdict = if text::is_lgtm(&review) {
            "Review verdict: LGTM".to_string()
        } else {
            format!("Review requested changes: {}", first_line(&review, 160))
        };
        self.emitter.phase(Phase::Review, &verdict);
        Ok(review)
    }

    async fn fix(&self, ws: &Workspace, review: &str) -> Result<(), DriverError> {
        self.agent(
            Phase::Fix,
            AgentMode::Fix,
            &ws.dir,
            "Address the review feedback provided on stdin.",
            Some(review),
        )
        .await?;
        Ok(())
    }

    async fn commit(&self, ws: &Workspace) -> Result<(), DriverError> {
        self.checked(&self.git(&ws.dir, ["add", "-A"])).await?;

        let quiet = self.git(&ws.dir, ["diff", "--cached", "--quiet"]);
        let staged = self.runner.run(&quiet).await?;
        match staged.exit_code {
            Some(0) => return Err(DriverError::NothingToCommit),
            Some(1) => {}
            exit_code => {
                return Err(DriverError::CommandFailed {
                    command: quiet.short_display(),
                    exit_code,
                    output: staged.combined(),
                });
            }
        }

        let diff = self
            .checked(&self.git(&ws.dir, ["diff", "--cached"]))
            .await?
            .stdout;
        let message = match self
            .agent(
                Phase::Commit,
                AgentMode::CommitMessage,
                &ws.dir,
                "Write the commit message.",
                Some(&diff),
            )
            .await
        {
            Ok(response) => text::commit_message(&response),
            Err(e) => {
                warn!(error = %e, "commit message generation failed");
                text::FALLBACK_COMMIT_MESSAGE.to_string()
            }
        };
        self.emitter
            .phase(Phase::Commit, &format!("Commit message: {}", message));
        self.checked(&self.git(&ws.dir, ["commit", "-m", message.as_str()]))
            .await?;
        Ok(())
    }

    async fn push(&self, ws: &Workspace) -> Result<(), DriverError> {
        self.retrying(
            Phase::Push,
            &self.git(&ws.dir, ["push", "-u", "origin", ws.branch.as_str()]),
        )
        .await?;

        let timing = &self.settings.timing;
        let attempts = timing.remote_poll_attempts.max(1);
        for attempt in 1..=attempts {
            let output = self
                .retrying(
                    Phase::Push,
                    &self.git(&ws.dir, ["ls-remote", "--heads", "origin", ws.branch.as_str()]),
                )
                .await?;
            if !output.stdout.trim().is_empty() {
                self.emitter
                    .phase(Phase::Push, &format!("Pushed {}", ws.branch));
                return Ok(());
            }
            debug!(attempt, branch = %ws.branch, "remote branch not visible yet");
            if attempt < attempts {
                tokio::time::sleep(timing.remote_poll_interval()).await;
            }
        }
        Err(DriverError::RemoteBranchMissing {
            branch: ws.branch.clone(),
            attempts,
        })
    }

    async fn open_pr(&self, ws: &Workspace, request: &RunRequest) -> Result<String, DriverError> {
        self.retrying(
            Phase::Pr,
            &self.git(&ws.dir, ["fetch", "origin", ws.base.as_str()]),
        )
        .await?;

        let range = format!("origin/{}..HEAD", ws.base);
        let ahead = self
            .checked(&self.git(&ws.dir, ["rev-list", "--count", range.as_str()]))
            .await?;
        let ahead: u64 = ahead.stdout.trim().parse().unwrap_or(0);
        if ahead == 0 {
            return Err(DriverError::NoCommitsAhead {
                branch: ws.branch.clone(),
                base: ws.base.clone(),
            });
        }

        let diff_range = format!("origin/{}...HEAD", ws.base);
        let diff = self
            .checked(&self.git(&ws.dir, ["diff", diff_range.as_str()]))
            .await?
            .stdout;
        let pr_text = match self
            .agent(
                Phase::Pr,
                AgentMode::PrText,
                &ws.dir,
                &request.prompt,
                Some(&diff),
            )
            .await
        {
            Ok(response) => text::parse_pr_text(&response),
            Err(e) => {
                warn!(error = %e, "PR text generation failed");
                text::parse_pr_text("")
            }
        };

        let output = self
            .retrying(
                Phase::Pr,
                &self.gh(
                    &ws.dir,
                    [
                        "pr",
                        "create",
                        "--base",
                        ws.base.as_str(),
                        "--head",
                        ws.branch.as_str(),
                        "--title",
                        pr_text.title.as_str(),
                        "--body",
                        pr_text.body.as_str(),
                    ],
                ),
            )
            .await?;
        let (url, _) = extract_pr_url(&output.combined()).ok_or(DriverError::MissingPrUrl)?;
        self.emitter
            .phase(Phase::Pr, &format!("Created pull request: {}", url));
        Ok(url)
    }
}
