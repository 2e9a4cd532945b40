//! Configuration for codeloop.
//!
//! Settings are read from `~/.codeloop/config.toml` (or `--config`), then
//! overridden by environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [general]
//! workspace_root = "/home/me/.codeloop/workspaces"
//! branch_prefix = "codeloop/"
//! skip_pr = false
//! notifications = true
//! approve_directories = true
//!
//! [tools]
//! git = "git"
//! gh = "gh"
//! agent = "claude"
//!
//! [models]
//! plan = "opus"
//! implement = "sonnet"
//!
//! [retry]
//! max_attempts = 3
//! delays_secs = [2, 5, 10]
//!
//! [setup]
//! commands = ["npm ci"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the state directory under the user's home.
pub const STATE_DIR_NAME: &str = ".codeloop";

/// Default state directory: `~/.codeloop`, or `./.codeloop` without a home.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR_NAME)
}

/// General pipeline behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory under which per-run workspaces are cloned.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Prefix prepended to generated branch names.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Skip push and PR creation by default.
    #[serde(default)]
    pub skip_pr: bool,
    /// Skip the planning phase by default.
    #[serde(default)]
    pub skip_plan: bool,
    /// Desktop notification when a run finishes.
    #[serde(default = "default_true")]
    pub notifications: bool,
    /// Pre-approve the workspace directory for the agent (`--add-dir`).
    #[serde(default = "default_true")]
    pub approve_directories: bool,
    /// Pass `--dangerously-skip-permissions` to the agent.
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    /// `gh pr merge` strategy: merge, squash or rebase.
    #[serde(default = "default_merge_method")]
    pub merge_method: String,
}

fn default_branch_prefix() -> String {
    "codeloop/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_merge_method() -> String {
    "squash".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            branch_prefix: default_branch_prefix(),
            skip_pr: false,
            skip_plan: false,
            notifications: true,
            approve_directories: true,
            skip_permissions: true,
            merge_method: default_merge_method(),
        }
    }
}

/// External command names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_git")]
    pub git: String,
    #[serde(default = "default_gh")]
    pub gh: String,
    #[serde(default = "default_agent")]
    pub agent: String,
}

fn default_git() -> String {
    "git".to_string()
}

fn default_gh() -> String {
    "gh".to_string()
}

fn default_agent() -> String {
    "claude".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: default_git(),
            gh: default_gh(),
            agent: default_agent(),
        }
    }
}

/// One model identifier per agent-invoking step. `None` lets the agent pick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub implement: Option<String>,
    #[serde(default)]
    pub review: Option<String>,
    #[serde(default)]
    pub fix: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub pr_text: Option<String>,
    #[serde(default)]
    pub branch_slug: Option<String>,
    #[serde(default)]
    pub resolve_conflicts: Option<String>,
}

/// Retry budget for network-sensitive commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first, clamped to 1..=3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before each retry; the last entry is reused.
    #[serde(default = "default_delays_secs")]
    pub delays_secs: Vec<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delays_secs() -> Vec<u64> {
    vec![2, 5, 10]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delays_secs: default_delays_secs(),
        }
    }
}

/// Commands run in order during the Setup phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Supervisor and Driver timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Grace window between SIGTERM and SIGKILL.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Poll period for tailing background log files.
    #[serde(default = "default_tail_interval_ms")]
    pub tail_interval_ms: u64,
    /// Delay before a coalesced registry write.
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
    /// Checks for the pushed branch to appear on the remote.
    #[serde(default = "default_remote_poll_attempts")]
    pub remote_poll_attempts: u32,
    #[serde(default = "default_remote_poll_interval_ms")]
    pub remote_poll_interval_ms: u64,
    /// Mergeability polls while a PR reports "checking".
    #[serde(default = "default_pr_poll_attempts")]
    pub pr_poll_attempts: u32,
    #[serde(default = "default_pr_poll_interval_ms")]
    pub pr_poll_interval_ms: u64,
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_tail_interval_ms() -> u64 {
    500
}

fn default_persist_debounce_ms() -> u64 {
    250
}

fn default_remote_poll_attempts() -> u32 {
    5
}

fn default_remote_poll_interval_ms() -> u64 {
    2_000
}

fn default_pr_poll_attempts() -> u32 {
    10
}

fn default_pr_poll_interval_ms() -> u64 {
    5_000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: default_stop_grace_ms(),
            tail_interval_ms: default_tail_interval_ms(),
            persist_debounce_ms: default_persist_debounce_ms(),
            remote_poll_attempts: default_remote_poll_attempts(),
            remote_poll_interval_ms: default_remote_poll_interval_ms(),
            pr_poll_attempts: default_pr_poll_attempts(),
            pr_poll_interval_ms: default_pr_poll_interval_ms(),
        }
    }
}

impl TimingConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn tail_interval(&self) -> Duration {
        Duration::from_millis(self.tail_interval_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn remote_poll_interval(&self) -> Duration {
        Duration::from_millis(self.remote_poll_interval_ms)
    }

    pub fn pr_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pr_poll_interval_ms)
    }
}

/// The complete config.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Where runs.json and logs live. Not read from the file.
    #[serde(skip)]
    pub state_dir: PathBuf,
}

impl Settings {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let mut settings: Settings =
            toml::from_str(content).context("Failed to parse config.toml")?;
        settings.state_dir = default_state_dir();
        Ok(settings)
    }

    /// Load the file if it exists (defaults otherwise), then apply
    /// environment overrides and the state directory.
    pub fn resolve(config_file: Option<&Path>, state_dir: Option<&Path>) -> Result<Self> {
        let state_dir = state_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(default_state_dir);
        let path = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| state_dir.join("config.toml"));
        let mut settings = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        settings.state_dir = state_dir;
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply `CODELOOP_*` overrides from the given lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup("CODELOOP_WORKSPACE_ROOT") {
            self.general.workspace_root = Some(PathBuf::from(root));
        }
        if let Some(agent) = lookup("CODELOOP_AGENT_CMD") {
            self.tools.agent = agent;
        }
        if let Some(prefix) = lookup("CODELOOP_BRANCH_PREFIX") {
            self.general.branch_prefix = prefix;
        }
        if let Some(skip) = lookup("CODELOOP_SKIP_PR") {
            self.general.skip_pr = skip != "false" && skip != "0";
        }
        if let Some(attempts) = lookup("CODELOOP_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.retry.max_attempts = attempts;
        }
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.toml")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("runs.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.general
            .workspace_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("workspaces"))
    }

    /// Log file a background Driver writes for `run_id`.
    pub fn run_log_file(&self, run_id: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log", run_id))
    }

    /// Human-readable problems with the configuration. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(1..=3).contains(&self.retry.max_attempts) {
            warnings.push(format!(
                "retry.max_attempts = {} will be clamped to 1..=3",
                self.retry.max_attempts
            ));
        }
        if !["merge", "squash", "rebase"].contains(&self.general.merge_method.as_str()) {
            warnings.push(format!(
                "general.merge_method '{}' is not one of merge, squash, rebase",
                self.general.merge_method
            ));
        }
        if self.general.branch_prefix.contains(char::is_whitespace) {
            warnings.push("general.branch_prefix must not contain whitespace".to_string());
        }
        for command in &self.setup.commands {
            if command.trim().is_empty() {
                warnings.push("setup.commands contains an empty command".to_string());
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.general.branch_prefix, "codeloop/");
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.delays_secs, vec![2, 5, 10]);
        assert_eq!(settings.tools.agent, "claude");
        assert!(settings.general.notifications);
        assert!(settings.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let settings = Settings::parse(
            r#"
            [general]
            skip_pr = true

            [models]
            review = "opus"

            [setup]
            commands = ["npm ci", "npm run build"]
            "#,
        )
        .unwrap();
        assert!(settings.general.skip_pr);
        assert_eq!(settings.general.branch_prefix, "codeloop/");
        assert_eq!(settings.models.review.as_deref(), Some("opus"));
        assert_eq!(settings.models.plan, None);
        assert_eq!(settings.setup.commands.len(), 2);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CODELOOP_AGENT_CMD", "/usr/local/bin/agent"),
            ("CODELOOP_SKIP_PR", "1"),
            ("CODELOOP_MAX_RETRIES", "2"),
            ("CODELOOP_BRANCH_PREFIX", "bot/"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        settings.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.tools.agent, "/usr/local/bin/agent");
        assert!(settings.general.skip_pr);
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.general.branch_prefix, "bot/");
    }

    #[test]
    fn test_resolve_uses_state_dir() {
        let dir = tempdir().unwrap();
        let settings = Settings::resolve(None, Some(dir.path())).unwrap();
        assert_eq!(settings.registry_path(), dir.path().join("runs.json"));
        assert_eq!(settings.workspace_root(), dir.path().join("workspaces"));
        assert_eq!(
            settings.run_log_file("abc"),
            dir.path().join("logs").join("abc.log")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut settings = Settings::default();
        settings.setup.commands = vec!["make".to_string()];
        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.setup.commands, vec!["make".to_string()]);
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let mut settings = Settings::default();
        settings.retry.max_attempts = 9;
        settings.general.merge_method = "octopus".to_string();
        let warnings = settings.validate();
        assert_eq!(warnings.len(), 2);
    }
}
