//! Typed error hierarchy for codeloop.
//!
//! One enum per subsystem:
//! - `DriverError`: pipeline phase failures inside the Driver process
//! - `SupervisorError`: launching, tailing and terminating Driver processes
//! - `RegistryError`: loading and persisting the durable run registry
//! - `PrError`: pull-request mergeability and conflict resolution

use thiserror::Error;

/// Errors raised while the Driver executes the phase sequence.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("No prompt provided")]
    MissingPrompt,

    #[error("Required tool '{tool}' is not available: {message}")]
    MissingTool { tool: String, message: String },

    #[error("Repository {path} has no 'origin' remote")]
    MissingRemote { path: std::path::PathBuf },

    #[error("Repository path {path} does not exist")]
    MissingRepository { path: std::path::PathBuf },

    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {exit_code:?}: {output}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("'{command}' still failing after {attempts} attempts: {output}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        output: String,
    },

    #[error("Setup command '{command}' failed: {output}")]
    SetupFailed { command: String, output: String },

    #[error("Agent returned an empty plan")]
    EmptyPlan,

    #[error("nothing to commit")]
    NothingToCommit,

    #[error("Remote branch {branch} did not become visible after {attempts} checks")]
    RemoteBranchMissing { branch: String, attempts: u32 },

    #[error("Branch {branch} has no commits ahead of {base}")]
    NoCommitsAhead { branch: String, base: String },

    #[error("Could not find a pull request URL in hosting CLI output")]
    MissingPrUrl,

    #[error("Failed to write workspace file at {path}: {source}")]
    WorkspaceIo {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    /// Validation errors happen before any workspace mutation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DriverError::MissingPrompt
                | DriverError::MissingTool { .. }
                | DriverError::MissingRemote { .. }
                | DriverError::MissingRepository { .. }
        )
    }

    /// Process exit code the Driver reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::NothingToCommit => 3,
            e if e.is_validation() => 2,
            _ => 1,
        }
    }
}

/// Errors from launching, tailing or terminating Driver processes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn driver process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Driver did not announce a background process (output: {output})")]
    MissingBootstrap { output: String },

    #[error("Run {id} not found")]
    RunNotFound { id: String },

    #[error("Run {id} is not running")]
    NotRunning { id: String },

    #[error("Run {id} has no known process id")]
    NoProcess { id: String },

    #[error("Signal delivery to process {pid} failed: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read log file {path}: {source}")]
    LogRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the durable registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read registry at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write registry at {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry at {path} is locked by another process")]
    Locked { path: std::path::PathBuf },

    #[error("Registry at {path} is not valid JSON: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Registry writer has shut down")]
    WriterClosed,
}

/// Errors from the pull-request lifecycle manager.
#[derive(Debug, Error)]
pub enum PrError {
    #[error("Run {id} not found")]
    RunNotFound { id: String },

    #[error("Run {id} has no pull request")]
    NoPullRequest { id: String },

    #[error("Pull request has merge conflicts; resolve them first")]
    Conflicted,

    #[error("Hosting CLI error: {0}")]
    Hosting(String),

    #[error("Unexpected hosting CLI output: {0}")]
    Parse(String),

    #[error("Conflict markers remain in {files:?} after resolution")]
    MarkersRemain { files: Vec<String> },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_to_commit_has_distinct_exit_code() {
        let err = DriverError::NothingToCommit;
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.to_string(), "nothing to commit");

        let other = DriverError::CommandFailed {
            command: "git commit".into(),
            exit_code: Some(1),
            output: "boom".into(),
        };
        assert_eq!(other.exit_code(), 1);
    }

    #[test]
    fn validation_errors_are_classified() {
        assert!(DriverError::MissingPrompt.is_validation());
        assert_eq!(DriverError::MissingPrompt.exit_code(), 2);
        let remote = DriverError::MissingRemote {
            path: "/repo".into(),
        };
        assert!(remote.is_validation());
        assert!(!DriverError::EmptyPlan.is_validation());
    }

    #[test]
    fn supervisor_signal_error_carries_pid() {
        let err = SupervisorError::Signal {
            pid: 42,
            source: std::io::Error::from_raw_os_error(1),
        };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn pr_error_converts_from_driver_error() {
        let err: PrError = DriverError::EmptyPlan.into();
        assert!(matches!(err, PrError::Driver(DriverError::EmptyPlan)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&DriverError::EmptyPlan);
        assert_std_error(&SupervisorError::NoProcess { id: "x".into() });
        assert_std_error(&RegistryError::WriterClosed);
        assert_std_error(&PrError::Conflicted);
    }
}
