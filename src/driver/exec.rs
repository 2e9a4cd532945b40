//! External command execution.
//!
//! Every git, hosting-CLI and agent call goes through [`CommandRunner`] so
//! the pipeline and the PR manager can be exercised against a scripted fake.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::errors::DriverError;

/// A command to run: program, arguments, working directory, optional stdin.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    /// Echo output lines live while still capturing them.
    pub stream: bool,
    /// Short name for diagnostics, e.g. `agent:review`.
    pub label: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// `program arg1 arg2 ...` for logs and error messages.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    /// Display form truncated for error messages.
    pub fn short_display(&self) -> String {
        crate::util::truncate_chars(&self.display(), 120)
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, used for failure classification.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            _ => self.stderr.trim_end().to_string(),
        }
    }
}

/// Runs external commands. Implementations must be `Send + Sync` so they can
/// be shared with spawned tasks.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. A non-zero exit is a successful call
    /// with a failing [`CommandOutput`]; only spawn/IO problems are errors.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DriverError>;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DriverError> {
        debug!(label = ?spec.label, command = %spec.short_display(), "exec");
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_remove("CLAUDECODE")
            .kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| DriverError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;

        let stdin_task = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                // The child may exit without reading everything.
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            })),
            _ => None,
        };

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;
        let stream = spec.stream;

        let stderr_task = tokio::spawn(collect_lines(stderr, move |line| {
            if stream {
                eprintln!("{}", line);
            }
        }));
        let stdout_text = collect_lines(stdout, |line| {
            if stream {
                println!("{}", line);
            }
        })
        .await;

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", spec.program))?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if let Some(task) = stdin_task {
            let _ = task.await;
        }

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: stdout_text,
            stderr: stderr_text,
        })
    }
}

/// Read `reader` to EOF line by line (lossy UTF-8), calling `on_line` for
/// each line and returning everything read.
async fn collect_lines<R, F>(reader: R, mut on_line: F) -> String
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut all = String::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                on_line(line);
                all.push_str(line);
                all.push('\n');
            }
        }
    }
    all
}
