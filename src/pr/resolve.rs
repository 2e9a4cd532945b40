//! Resolve-and-merge in an ephemeral workspace.

use std::path::Path;

use tracing::info;

use super::PrManager;
use crate::driver::agent::{AgentMode, agent_command};
use crate::driver::exec::CommandSpec;
use crate::driver::retry::run_with_retry;
use crate::errors::{DriverError, PrError};
use crate::run::{MergeStatus, PrState};
use crate::util::first_line;

/// Lines git writes for an unresolved conflict.
const MARKER_PATTERN: &str = "^(<<<<<<<|=======|>>>>>>>)( |$)";

impl PrManager {
    /// Merge the PR's base into its head in a throwaway clone, let the agent
    /// resolve any conflicted files, push the result to the head branch and
    /// merge. The clone is removed however this returns.
    pub async fn resolve_and_merge(&self, id: &str) -> Result<PrState, PrError> {
        let state = self.refresh(id).await?;
        if state.merge_status == MergeStatus::Merged {
            return Ok(state);
        }
        let (run, _) = self.run_with_pr(id)?;
        let head = state
            .head_ref
            .clone()
            .ok_or_else(|| PrError::Parse("pull request has no head ref".to_string()))?;
        let base = state
            .base_ref
            .clone()
            .ok_or_else(|| PrError::Parse("pull request has no base ref".to_string()))?;

        let origin = self
            .checked(self.git_command(["remote", "get-url", "origin"]).cwd(&run.repo_path))
            .await?;
        let origin = origin.trim().to_string();

        let temp = tempfile::Builder::new()
            .prefix("codeloop-resolve-")
            .tempdir()
            .map_err(|e| PrError::Other(e.into()))?;
        let dir = temp.path().join("repo");
        info!(run_id = %id, workspace = %dir.display(), "resolving pull request conflicts");

        let target = dir.display().to_string();
        self.retrying(
            self.git_command(["clone", "--branch", head.as_str(), origin.as_str(), target.as_str()])
                .cwd(temp.path()),
        )
        .await?;
        self.retrying(self.git_command(["fetch", "origin", base.as_str()]).cwd(&dir))
            .await?;

        let upstream = format!("origin/{}", base);
        let merged = self
            .runner
            .run(
                &self
                    .git_command(["merge", "--no-edit", upstream.as_str()])
                    .cwd(&dir),
            )
            .await?;
        if !merged.success() {
            let files = self.conflicted_files(&dir).await?;
            if files.is_empty() {
                return Err(PrError::Hosting(first_line(&merged.combined(), 300)));
            }
            self.set_status(
                id,
                MergeStatus::Conflict,
                format!("Resolving conflicts in {} file(s)", files.len()),
            );
            if let Err(e) = self.resolve_files(&dir, &run.prompt, &files).await {
                let message = match &e {
                    PrError::MarkersRemain { files } => {
                        format!("Conflict markers remain in {}", files.join(", "))
                    }
                    other => format!(
                        "Conflict resolution failed: {}",
                        first_line(&other.to_string(), 200)
                    ),
                };
                self.set_status(id, MergeStatus::Conflict, message);
                return Err(e);
            }

            let mut add = vec!["add".to_string(), "--".to_string()];
            add.extend(files.iter().cloned());
            self.checked(self.git_command(add).cwd(&dir)).await?;
            self.checked(self.git_command(["commit", "--no-edit"]).cwd(&dir))
                .await?;
        }

        let refspec = format!("HEAD:{}", head);
        self.retrying(self.git_command(["push", "origin", refspec.as_str()]).cwd(&dir))
            .await?;
        drop(temp);

        self.watch(id).await?;
        self.merge(id).await
    }

    async fn conflicted_files(&self, dir: &Path) -> Result<Vec<String>, PrError> {
        let output = self
            .checked(self.git_command(["diff", "--name-only", "--diff-filter=U"]).cwd(dir))
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn resolve_files(&self, dir: &Path, task: &str, files: &[String]) -> Result<(), PrError> {
        let listing = files.join("\n");
        let prompt = format!("Resolve the merge conflicts in: {}", files.join(", "));
        let context = format!("Original task:\n{}\n\nConflicted files:\n{}", task, listing);
        let spec = agent_command(
            &self.settings,
            AgentMode::ResolveConflicts,
            dir,
            &prompt,
            Some(&context),
        );
        self.retrying(spec).await?;

        let mut grep = vec![
            "grep".to_string(),
            "-l".to_string(),
            "-E".to_string(),
            MARKER_PATTERN.to_string(),
            "--".to_string(),
        ];
        grep.extend(files.iter().cloned());
        let output = self.runner.run(&self.git_command(grep).cwd(dir)).await?;
        match output.exit_code {
            // git grep exits 1 when nothing matches.
            Some(1) => Ok(()),
            Some(0) => Err(PrError::MarkersRemain {
                files: output
                    .stdout
                    .lines()
                    .map(str::to_string)
                    .collect(),
            }),
            _ => Err(PrError::Hosting(first_line(&output.combined(), 300))),
        }
    }

    /// Retry-wrapped git or agent call.
    async fn retrying(&self, spec: CommandSpec) -> Result<String, PrError> {
        let output = run_with_retry(self.runner.as_ref(), &self.retry, &spec, &mut |notice| {
            tracing::debug!("{}", notice.message())
        })
        .await?;
        Ok(output.stdout)
    }

    /// Local command run once; non-zero exit is an error.
    async fn checked(&self, spec: CommandSpec) -> Result<String, PrError> {
        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(PrError::Driver(DriverError::CommandFailed {
                command: spec.short_display(),
                exit_code: output.exit_code,
                output: output.combined(),
            }))
        }
    }
}
