//! PR Lifecycle Manager.
//!
//! Tracks a Run's pull request after the Driver opens it: mergeability
//! refresh, merge requests (optionally automatic on completion), and
//! agent-assisted conflict resolution. Every state change goes through
//! [`RunRegistry::mutate`].

mod resolve;
pub mod view;

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::driver::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::driver::retry::{RetryPolicy, run_with_retry};
use crate::errors::{DriverError, PrError};
use crate::registry::RunRegistry;
use crate::run::{MergeStatus, PrState, Run};
use crate::util::{first_line, truncate_chars};
use view::{PrView, VIEW_FIELDS, pr_coordinates};

static UNRESOLVED_CONVERSATIONS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)unresolved (review )?(conversation|thread)|conversation resolution").unwrap()
});

const REVIEW_THREADS_QUERY: &str = "query($owner: String!, $repo: String!, $number: Int!) { \
     repository(owner: $owner, name: $repo) { pullRequest(number: $number) { \
     reviewThreads(first: 100) { nodes { id isResolved } } } } }";

const RESOLVE_THREAD_MUTATION: &str = "mutation($id: ID!) { \
     resolveReviewThread(input: {threadId: $id}) { thread { isResolved } } }";

pub struct PrManager {
    runner: Arc<dyn CommandRunner>,
    registry: Arc<RunRegistry>,
    settings: Arc<Settings>,
    retry: RetryPolicy,
}

impl PrManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        registry: Arc<RunRegistry>,
        settings: Arc<Settings>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&settings.retry);
        Self {
            runner,
            registry,
            settings,
            retry,
        }
    }

    fn run_with_pr(&self, id: &str) -> Result<(Run, PrState), PrError> {
        let run = self
            .registry
            .get(id)
            .ok_or_else(|| PrError::RunNotFound { id: id.to_string() })?;
        let pr = run
            .pr
            .clone()
            .ok_or_else(|| PrError::NoPullRequest { id: id.to_string() })?;
        Ok((run, pr))
    }

    fn set_status(&self, id: &str, status: MergeStatus, message: impl Into<String>) -> Option<PrState> {
        let message = message.into();
        self.registry
            .mutate(id, |run| {
                let pr = run.pr.as_mut()?;
                pr.merge_status = status;
                pr.message = Some(message);
                Some(pr.clone())
            })
            .and_then(|(_, pr)| pr)
    }

    fn gh_command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.settings.tools.gh.clone(), args)
    }

    fn git_command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.settings.tools.git.clone(), args)
    }

    /// Hosting-CLI call under the retry policy; failures become `Hosting`.
    async fn gh(&self, spec: CommandSpec) -> Result<CommandOutput, PrError> {
        run_with_retry(self.runner.as_ref(), &self.retry, &spec, &mut |notice| {
            debug!("{}", notice.message())
        })
        .await
        .map_err(hosting_error)
    }

    /// Query the hosting platform and record mergeability plus PR metadata.
    pub async fn refresh(&self, id: &str) -> Result<PrState, PrError> {
        let (run, pr) = self.run_with_pr(id)?;
        let mut spec = self.gh_command(["pr", "view", pr.url.as_str(), "--json", VIEW_FIELDS]);
        if run.repo_path.is_dir() {
            spec = spec.cwd(&run.repo_path);
        }
        let output = self.gh(spec).await?;
        let view = PrView::parse(&output.stdout)
            .map_err(|e| PrError::Parse(format!("{}: {}", e, first_line(&output.stdout, 120))))?;
        let (status, message) = view.classify();
        debug!(run_id = %id, status = status.as_str(), "pull request refreshed");

        self.registry
            .mutate(id, |run| {
                let pr = run.pr.get_or_insert_with(|| PrState::new(view.url.clone(), None));
                if !view.url.is_empty() {
                    pr.url = view.url.clone();
                }
                pr.number = Some(view.number);
                pr.title = Some(view.title.clone()).filter(|t| !t.is_empty());
                pr.head_ref = Some(view.head_ref_name.clone()).filter(|h| !h.is_empty());
                pr.base_ref = Some(view.base_ref_name.clone()).filter(|b| !b.is_empty());
                pr.merge_status = status;
                pr.message = Some(message);
                pr.clone()
            })
            .map(|(_, pr)| pr)
            .ok_or_else(|| PrError::RunNotFound { id: id.to_string() })
    }

    /// Refresh until the status leaves `checking` or the poll budget runs out.
    pub async fn watch(&self, id: &str) -> Result<PrState, PrError> {
        let timing = &self.settings.timing;
        let attempts = timing.pr_poll_attempts.max(1);
        let mut state = self.refresh(id).await?;
        for _ in 1..attempts {
            if state.merge_status != MergeStatus::Checking {
                break;
            }
            tokio::time::sleep(timing.pr_poll_interval()).await;
            state = self.refresh(id).await?;
        }
        Ok(state)
    }

    /// Merge the PR. Refuses while it has conflicts.
    pub async fn merge(&self, id: &str) -> Result<PrState, PrError> {
        let state = self.refresh(id).await?;
        match state.merge_status {
            MergeStatus::Conflict => return Err(PrError::Conflicted),
            MergeStatus::Merged => return Ok(state),
            _ => {}
        }

        self.set_status(id, MergeStatus::AutoMerging, "Merge requested");
        let result = match self.request_merge(&state.url).await {
            Err(PrError::Hosting(output)) if UNRESOLVED_CONVERSATIONS_REGEX.is_match(&output) => {
                info!(run_id = %id, "merge blocked by unresolved conversations, resolving threads");
                match self.resolve_review_threads(&state.url).await {
                    Ok(resolved) => {
                        debug!(run_id = %id, resolved, "review threads resolved");
                        self.request_merge(&state.url).await
                    }
                    Err(e) => Err(e),
                }
            }
            other => other,
        };

        match result {
            Ok(()) => {
                let method = &self.settings.general.merge_method;
                info!(run_id = %id, method = %method, "pull request merged");
                self.set_status(id, MergeStatus::Merged, format!("Merged ({})", method))
                    .ok_or_else(|| PrError::RunNotFound { id: id.to_string() })
            }
            Err(e) => {
                warn!(run_id = %id, error = %e, "merge failed");
                self.set_status(id, MergeStatus::Failed, truncate_chars(&e.to_string(), 300));
                Err(e)
            }
        }
    }

    async fn request_merge(&self, url: &str) -> Result<(), PrError> {
        let method = format!("--{}", self.settings.general.merge_method);
        self.gh(self.gh_command(["pr", "merge", url, method.as_str()]))
            .await?;
        Ok(())
    }

    /// Resolve every open review thread on the PR. Returns how many.
    pub async fn resolve_review_threads(&self, url: &str) -> Result<usize, PrError> {
        let (owner, repo, number) =
            pr_coordinates(url).ok_or_else(|| PrError::Parse(format!("not a PR URL: {}", url)))?;
        let query = format!("query={}", REVIEW_THREADS_QUERY);
        let owner = format!("owner={}", owner);
        let repo = format!("repo={}", repo);
        let number = format!("number={}", number);
        let output = self
            .gh(self.gh_command(
                [
                    "api",
                    "graphql",
                    "-f",
                    query.as_str(),
                    "-f",
                    owner.as_str(),
                    "-f",
                    repo.as_str(),
                    "-F",
                    number.as_str(),
                ],
            ))
            .await?;
        let thread_ids = unresolved_thread_ids(&output.stdout)?;

        let mutation = format!("query={}", RESOLVE_THREAD_MUTATION);
        for thread_id in &thread_ids {
            let id_arg = format!("id={}", thread_id);
            self.gh(self.gh_command(
                [
                    "api",
                    "graphql",
                    "-f",
                    mutation.as_str(),
                    "-f",
                    id_arg.as_str(),
                ],
            ))
            .await?;
        }
        Ok(thread_ids.len())
    }

    /// Auto-merge path run when a Run completes. Skips, without error, on
    /// conflict so the explicit resolve path stays in charge. The run's
    /// pending marker is cleared whatever the outcome; only an attempt cut
    /// off mid-flight leaves it set.
    pub async fn auto_merge(&self, id: &str) -> Result<Option<PrState>, PrError> {
        let result = self.attempt_auto_merge(id).await;
        self.registry.mutate(id, |run| run.auto_merge_pending = false);
        result
    }

    async fn attempt_auto_merge(&self, id: &str) -> Result<Option<PrState>, PrError> {
        let Some(run) = self.registry.get(id) else {
            return Err(PrError::RunNotFound { id: id.to_string() });
        };
        if !run.auto_merge || run.pr.is_none() {
            return Ok(None);
        }
        let state = self.watch(id).await?;
        if state.merge_status == MergeStatus::Conflict {
            info!(run_id = %id, "auto-merge skipped: conflicts");
            return Ok(self.set_status(
                id,
                MergeStatus::Conflict,
                "Auto-merge skipped: resolve conflicts first",
            ));
        }
        self.merge(id).await.map(Some)
    }
}

fn hosting_error(e: DriverError) -> PrError {
    match e {
        DriverError::CommandFailed { output, .. } | DriverError::RetriesExhausted { output, .. } => {
            PrError::Hosting(truncate_chars(output.trim(), 500))
        }
        other => PrError::Driver(other),
    }
}

fn unresolved_thread_ids(json: &str) -> Result<Vec<String>, PrError> {
    let value: Value = serde_json::from_str(json.trim())
        .map_err(|e| PrError::Parse(format!("review threads: {}", e)))?;
    let nodes = value
        .pointer("/data/repository/pullRequest/reviewThreads/nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| PrError::Parse("review threads missing from response".to_string()))?;
    Ok(nodes
        .iter()
        .filter(|n| !n.get("isResolved").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|n| n.get("id").and_then(Value::as_str).map(str::to_string))
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::driver::testing::{ScriptedRunner, fail, ok};
    use crate::run::ExecutionMode;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) const URL: &str = "https://github.com/acme/widgets/pull/12";

    pub(crate) fn view_json(mergeable: &str, merge_state: &str) -> String {
        format!(
            r#"{{"baseRefName":"main","headRefName":"codeloop/add-cache","mergeStateStatus":"{}","mergeable":"{}","number":12,"state":"OPEN","title":"Add cache","url":"{}"}}"#,
            merge_state, mergeable, URL
        )
    }

    pub(crate) struct Fixture {
        pub(crate) _dir: TempDir,
        pub(crate) runner: Arc<ScriptedRunner>,
        pub(crate) registry: Arc<RunRegistry>,
        pub(crate) manager: PrManager,
        pub(crate) run_id: String,
    }

    pub(crate) fn fixture(auto_merge: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry =
            RunRegistry::open(&dir.path().join("runs.json"), Duration::from_millis(5)).unwrap();
        let mut settings = Settings::default();
        settings.retry.delays_secs = vec![0];
        settings.timing.pr_poll_interval_ms = 1;
        settings.timing.pr_poll_attempts = 3;
        let mut run = Run::new(dir.path().to_path_buf(), "Add cache", ExecutionMode::Foreground);
        run.auto_merge = auto_merge;
        run.pr = Some(PrState::new(URL, Some(12)));
        let run = registry.insert(run);
        let runner = Arc::new(ScriptedRunner::new());
        let manager = PrManager::new(runner.clone(), registry.clone(), Arc::new(settings));
        Fixture {
            _dir: dir,
            runner,
            registry,
            manager,
            run_id: run.id,
        }
    }

    #[tokio::test]
    async fn test_refresh_fills_metadata() {
        let f = fixture(false);
        f.runner.on("gh pr view", ok(&view_json("MERGEABLE", "CLEAN")));
        let state = f.manager.refresh(&f.run_id).await.unwrap();
        assert_eq!(state.merge_status, MergeStatus::Ready);
        assert_eq!(state.title.as_deref(), Some("Add cache"));
        assert_eq!(state.head_ref.as_deref(), Some("codeloop/add-cache"));
        assert_eq!(state.base_ref.as_deref(), Some("main"));
        assert_eq!(f.registry.get(&f.run_id).unwrap().pr, Some(state));
    }

    #[tokio::test]
    async fn test_refresh_without_pr() {
        let f = fixture(false);
        f.registry.mutate(&f.run_id, |r| r.pr = None);
        assert!(matches!(
            f.manager.refresh(&f.run_id).await,
            Err(PrError::NoPullRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_merge_refuses_conflicts() {
        let f = fixture(false);
        f.runner.on("gh pr view", ok(&view_json("CONFLICTING", "DIRTY")));
        assert!(matches!(
            f.manager.merge(&f.run_id).await,
            Err(PrError::Conflicted)
        ));
        assert_eq!(f.runner.count("gh pr merge"), 0);
    }

    #[tokio::test]
    async fn test_merge_success() {
        let f = fixture(false);
        f.runner.on("gh pr view", ok(&view_json("MERGEABLE", "CLEAN")));
        let state = f.manager.merge(&f.run_id).await.unwrap();
        assert_eq!(state.merge_status, MergeStatus::Merged);
        let merge = f.runner.matching("gh pr merge");
        assert_eq!(merge[0].args, vec!["pr", "merge", URL, "--squash"]);
    }

    #[tokio::test]
    async fn test_merge_failure_records_error() {
        let f = fixture(false);
        f.runner.on("gh pr view", ok(&view_json("MERGEABLE", "BLOCKED")));
        f.runner.on("gh pr merge", fail(1, "base branch policy prohibits the merge"));
        let err = f.manager.merge(&f.run_id).await.unwrap_err();
        assert!(matches!(err, PrError::Hosting(_)));
        let pr = f.registry.get(&f.run_id).unwrap().pr.unwrap();
        assert_eq!(pr.merge_status, MergeStatus::Failed);
        assert!(pr.message.unwrap().contains("prohibits"));
    }

    #[tokio::test]
    async fn test_unresolved_conversations_are_resolved_then_retried() {
        let f = fixture(false);
        f.runner.on("gh pr view", ok(&view_json("MERGEABLE", "BLOCKED")));
        f.runner.on_seq(
            "gh pr merge",
            vec![
                fail(1, "GraphQL: All comments must be resolved: unresolved conversations"),
                ok(""),
            ],
        );
        f.runner.on(
            "gh api graphql -f query=query",
            ok(r#"{"data":{"repository":{"pullRequest":{"reviewThreads":{"nodes":[
                {"id":"T_1","isResolved":false},{"id":"T_2","isResolved":true},{"id":"T_3","isResolved":false}
            ]}}}}}"#),
        );
        let state = f.manager.merge(&f.run_id).await.unwrap();
        assert_eq!(state.merge_status, MergeStatus::Merged);
        assert_eq!(f.runner.count("gh pr merge"), 2);
        assert_eq!(f.runner.count("gh api graphql -f query=mutation"), 2);
    }

    #[tokio::test]
    async fn test_watch_polls_while_checking() {
        let f = fixture(false);
        f.runner.on_seq(
            "gh pr view",
            vec![
                ok(&view_json("UNKNOWN", "UNKNOWN")),
                ok(&view_json("MERGEABLE", "CLEAN")),
            ],
        );
        let state = f.manager.watch(&f.run_id).await.unwrap();
        assert_eq!(state.merge_status, MergeStatus::Ready);
        assert_eq!(f.runner.count("gh pr view"), 2);
    }

    #[tokio::test]
    async fn test_auto_merge_skips_on_conflict() {
        let f = fixture(true);
        f.runner.on("gh pr view", ok(&view_json("CONFLICTING", "DIRTY")));
        let state = f.manager.auto_merge(&f.run_id).await.unwrap().unwrap();
        assert_eq!(state.merge_status, MergeStatus::Conflict);
        assert_eq!(f.runner.count("gh pr merge"), 0);
    }

    #[tokio::test]
    async fn test_auto_merge_clears_pending_marker() {
        let f = fixture(true);
        f.registry.mutate(&f.run_id, |r| r.auto_merge_pending = true);
        f.runner.on("gh pr view", ok(&view_json("MERGEABLE", "CLEAN")));
        let state = f.manager.auto_merge(&f.run_id).await.unwrap().unwrap();
        assert_eq!(state.merge_status, MergeStatus::Merged);
        assert!(!f.registry.get(&f.run_id).unwrap().auto_merge_pending);


        let f = fixture(true);
        f.registry.mutate(&f.run_id, |r| r.auto_merge_pending = true);
        f.runner.on("gh pr view", ok(&view_json("MERGEABLE", "BLOCKED")));
        f.runner.on("gh pr merge", fail(1, "base branch policy prohibits the merge"));
        assert!(f.manager.auto_merge(&f.run_id).await.is_err());
        assert!(!f.registry.get(&f.run_id).unwrap().auto_merge_pending);
    }

    #[tokio::test]
    async fn test_auto_merge_only_when_requested() {
        let f = fixture(false);
        assert_eq!(f.manager.auto_merge(&f.run_id).await.unwrap(), None);
        assert!(f.runner.calls().is_empty());
    }
}
