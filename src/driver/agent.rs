//! AI coding-agent invocation modes.
//!
//! The agent is a `claude`-compatible CLI run with `--print`. The short
//! instruction for each mode goes in `--append-system-prompt`, the task as the
//! final argument, and bulky context (plan, diff, review) on stdin.

use std::path::Path;

use super::exec::CommandSpec;
use crate::config::{ModelsConfig, Settings};

/// Fixed instruction modes the pipeline and PR manager use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Plan,
    Implement,
    Review,
    Fix,
    CommitMessage,
    PrText,
    BranchSlug,
    ResolveConflicts,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Fix => "fix",
            Self::CommitMessage => "commit_message",
            Self::PrText => "pr_text",
            Self::BranchSlug => "branch_slug",
            Self::ResolveConflicts => "resolve_conflicts",
        }
    }

    /// Diagnostic label, also used to match calls in tests.
    pub fn label(&self) -> String {
        format!("agent:{}", self.as_str())
    }

    pub fn model<'a>(&self, models: &'a ModelsConfig) -> Option<&'a str> {
        match self {
            Self::Plan => models.plan.as_deref(),
            Self::Implement => models.implement.as_deref(),
            Self::Review => models.review.as_deref(),
            Self::Fix => models.fix.as_deref(),
            Self::CommitMessage => models.commit_message.as_deref(),
            Self::PrText => models.pr_text.as_deref(),
            Self::BranchSlug => models.branch_slug.as_deref(),
            Self::ResolveConflicts => models.resolve_conflicts.as_deref(),
        }
    }

    /// Long-running modes echo their output live.
    pub fn streams(&self) -> bool {
        matches!(
            self,
            Self::Plan | Self::Implement | Self::Fix | Self::ResolveConflicts
        )
    }

    pub fn instructions(&self) -> &'static str {
        match self {
            Self::Plan => {
                "You are running non-interactively. Never ask questions: make reasonable \
                 assumptions and proceed. Produce a concise, numbered implementation plan for \
                 the task. Do not modify any files."
            }
            Self::Implement => {
                "You are running non-interactively. Never ask questions. Implement the task in \
                 the current repository, following the plan provided on stdin. Edit files \
                 directly and do not commit."
            }
            Self::Review => {
                "Review the diff provided on stdin against the task. If it is correct and \
                 complete, reply with exactly LGTM and nothing else. Otherwise list the concrete \
                 problems that must be fixed."
            }
            Self::Fix => {
                "You are running non-interactively. Never ask questions. Address every problem \
                 in the review provided on stdin by editing files directly. Do not commit."
            }
            Self::CommitMessage => {
                "Write a single-line git commit message for the diff on stdin. Use the \
                 imperative mood, lowercase, no trailing punctuation, at most 72 characters. \
                 Reply with the message only."
            }
            Self::PrText => {
                "Write a pull request title and body for the diff on stdin. Reply with a single \
                 JSON object of the form {\"title\": \"...\", \"body\": \"...\"} and nothing else."
            }
            Self::BranchSlug => {
                "Reply with a short git branch name slug (two or three lowercase words joined by \
                 hyphens) describing the task. Reply with the slug only."
            }
            Self::ResolveConflicts => {
                "You are running non-interactively. Never ask questions. The files listed below \
                 contain git merge conflict markers. Resolve every conflict by editing only those \
                 files so both sides' intent is preserved, and remove all markers. Do not commit."
            }
        }
    }
}

/// Build the agent command for `mode` in `cwd`.
pub fn agent_command(
    settings: &Settings,
    mode: AgentMode,
    cwd: &Path,
    prompt: &str,
    context: Option<&str>,
) -> CommandSpec {
    let mut args = vec!["--print".to_string()];
    if let Some(model) = mode.model(&settings.models) {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if settings.general.skip_permissions {
        args.push("--dangerously-skip-permissions".to_string());
    }
    if settings.general.approve_directories {
        args.push("--add-dir".to_string());
        args.push(cwd.display().to_string());
    }
    args.push("--append-system-prompt".to_string());
    args.push(mode.instructions().to_string());
    args.push(prompt.to_string());

    let mut spec = CommandSpec::new(settings.tools.agent.clone(), args)
        .cwd(cwd)
        .streaming(mode.streams())
        .label(mode.label());
    if let Some(context) = context {
        spec = spec.stdin(context);
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_shape() {
        let mut settings = Settings::default();
        settings.models.review = Some("opus".to_string());
        let spec = agent_command(
            &settings,
            AgentMode::Review,
            Path::new("/ws/run"),
            "Add caching",
            Some("diff --git a b"),
        );
        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args[0], "--print");
        assert_eq!(&spec.args[1..3], &["--model".to_string(), "opus".to_string()]);
        assert!(spec.args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(spec.args.contains(&"/ws/run".to_string()));
        assert_eq!(spec.args.last().map(String::as_str), Some("Add caching"));
        assert_eq!(spec.stdin.as_deref(), Some("diff --git a b"));
        assert_eq!(spec.label.as_deref(), Some("agent:review"));
        assert!(!spec.stream);
    }

    #[test]
    fn test_toggles_drop_optional_flags() {
        let mut settings = Settings::default();
        settings.general.skip_permissions = false;
        settings.general.approve_directories = false;
        let spec = agent_command(&settings, AgentMode::Plan, Path::new("/ws"), "task", None);
        assert!(!spec.args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!spec.args.contains(&"--add-dir".to_string()));
        assert!(!spec.args.contains(&"--model".to_string()));
        assert!(spec.stream);
        assert!(spec.stdin.is_none());
    }
}
