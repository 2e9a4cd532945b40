use std::collections::VecDeque;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::{Phase, PhaseMap};

/// Log entries retained per run; the oldest are dropped first.
pub const MAX_LOG_ENTRIES: usize = 2000;

/// Tag given to lines that are not in the structured `[time] [PHASE] msg` shape.
pub const OUTPUT_TAG: &str = "OUTPUT";

/// Tag of the terminal line the Driver prints after the last phase.
pub const DONE_TAG: &str = "DONE";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Foreground,
    Background,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
        }
    }
}

/// One line of Driver output, structured or not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// Timestamp as printed by the Driver, or generated for unstructured lines.
    pub timestamp: String,
    /// Phase wire tag, `DONE`, or `OUTPUT`.
    pub phase_tag: String,
    pub message: String,
    /// Line as received, with terminal escapes stripped.
    pub raw: String,
}

impl LogEntry {
    pub fn phase(&self) -> Option<Phase> {
        Phase::from_tag(&self.phase_tag)
    }

    pub fn is_structured(&self) -> bool {
        self.phase_tag != OUTPUT_TAG
    }

    /// Entry produced by the supervisor itself rather than the Driver.
    pub fn synthetic(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            timestamp: now_timestamp(),
            phase_tag: OUTPUT_TAG.to_string(),
            raw: message.clone(),
            message,
        }
    }
}

/// Local wall-clock time in the wire format `YYYY-MM-DD HH:MM:SS`.
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    None,
    Checking,
    Ready,
    Conflict,
    AutoMerging,
    Merged,
    Failed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Checking => "checking",
            Self::Ready => "ready",
            Self::Conflict => "conflict",
            Self::AutoMerging => "auto_merging",
            Self::Merged => "merged",
            Self::Failed => "failed",
        }
    }
}

/// Pull-request metadata, populated once the Driver reports a PR URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PrState {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub number: Option<u64>,
    #[serde(default)]
    pub head_ref: Option<String>,
    #[serde(default)]
    pub base_ref: Option<String>,
    #[serde(default)]
    pub merge_status: MergeStatus,
    #[serde(default)]
    pub message: Option<String>,
}

impl PrState {
    pub fn new(url: impl Into<String>, number: Option<u64>) -> Self {
        Self {
            url: url.into(),
            number,
            merge_status: MergeStatus::Checking,
            message: Some("Checking mergeability".to_string()),
            ..Default::default()
        }
    }
}

/// One end-to-end execution of the pipeline against one branch.
///
/// Fields added after the first schema version carry `#[serde(default)]` so
/// older registry files still load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub repo_path: PathBuf,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub current_phase: Option<Phase>,
    #[serde(default)]
    pub phases: PhaseMap,
    #[serde(default)]
    pub logs: VecDeque<LogEntry>,
    #[serde(default)]
    pub pr: Option<PrState>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub auto_merge: bool,
    /// Set when a completed run still owes its auto-merge attempt; cleared
    /// once an attempt has run to the end.
    #[serde(default)]
    pub auto_merge_pending: bool,
    #[serde(default)]
    pub skip_pr: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub log_offset: u64,
    #[serde(default)]
    pub total_duration_secs: Option<u64>,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

impl Run {
    pub fn new(repo_path: PathBuf, prompt: impl Into<String>, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            repo_path,
            prompt: prompt.into(),
            branch_name: None,
            status: RunStatus::Running,
            current_phase: None,
            phases: PhaseMap::default(),
            logs: VecDeque::new(),
            pr: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            pid: None,
            mode,
            auto_merge: false,
            auto_merge_pending: false,
            skip_pr: false,
            error: None,
            log_file: None,
            log_offset: 0,
            total_duration_secs: None,
            workspace: None,
        }
    }

    /// Append an entry, dropping the oldest once [`MAX_LOG_ENTRIES`] is exceeded.
    pub fn push_log(&mut self, entry: LogEntry) {
        self.logs.push_back(entry);
        while self.logs.len() > MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
    }

    /// Whether the Driver printed its terminal `DONE` line.
    pub fn done_seen(&self) -> bool {
        self.total_duration_secs.is_some()
    }

    /// Move to a terminal status. Returns false (and changes nothing) if the
    /// run is already terminal.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        if status == RunStatus::Completed {
            self.phases.complete_active();
        } else {
            self.phases.fail_active();
        }
        if error.is_some() {
            self.error = error;
        }
        self.finished_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_log_is_bounded() {
        let mut run = Run::new("/repo".into(), "task", ExecutionMode::Foreground);
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            run.push_log(LogEntry::synthetic(format!("line {}", i)));
        }
        assert_eq!(run.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(run.logs.front().unwrap().message, "line 5");
    }

    #[test]
    fn test_finish_is_final() {
        let mut run = Run::new("/repo".into(), "task", ExecutionMode::Foreground);
        assert!(run.finish(RunStatus::Stopped, None));
        assert!(!run.finish(RunStatus::Failed, Some("late".into())));
        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(run.error, None);
    }

    #[test]
    fn test_finish_failed_marks_active_phase_failed() {
        let mut run = Run::new("/repo".into(), "task", ExecutionMode::Foreground);
        run.phases.activate(Phase::Implement);
        run.finish(RunStatus::Failed, Some("boom".into()));
        assert_eq!(
            run.phases.get(Phase::Implement),
            crate::phase::PhaseStatus::Failed
        );
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_old_schema_loads_with_defaults() {
        let json = r#"{
            "id": "abc",
            "repo_path": "/repo",
            "status": "running",
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let run: Run = serde_json::from_str(json).unwrap();
        assert!(run.phases.is_total());
        assert_eq!(run.mode, ExecutionMode::Foreground);
        assert!(run.logs.is_empty());
        assert_eq!(run.log_offset, 0);
        assert!(run.pr.is_none());
        assert!(!run.auto_merge_pending);
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("stopped".parse::<RunStatus>(), Ok(RunStatus::Stopped));
        assert!("paused".parse::<RunStatus>().is_err());
    }
}
