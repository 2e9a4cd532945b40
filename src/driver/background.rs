//! Detached re-execution for `drive --background`.

use regex::Regex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use tracing::info;

static BOOTSTRAP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pid=(\d+)\s+log=(.+)$").unwrap());

/// The one line a background launch prints before exiting.
pub fn format_bootstrap(pid: u32, log_file: &Path) -> String {
    format!(
        "Background run started: pid={} log={}",
        pid,
        log_file.display()
    )
}

/// Find the bootstrap line in launcher output.
pub fn parse_bootstrap(output: &str) -> Option<(u32, PathBuf)> {
    output.lines().find_map(|line| {
        let caps = BOOTSTRAP_REGEX.captures(line.trim())?;
        let pid = caps.get(1)?.as_str().parse().ok()?;
        let log = PathBuf::from(caps.get(2)?.as_str().trim());
        Some((pid, log))
    })
}

/// Re-execute the current binary with `args` in its own process group,
/// stdin closed and both output streams appended to `log_file`. Returns the
/// child's pid; the child is not waited on.
pub fn spawn_detached(args: &[String], log_file: &Path) -> Result<u32> {
    let exe = std::env::current_exe().context("Failed to resolve current executable")?;
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;
    let stderr = stdout
        .try_clone()
        .context("Failed to clone log file handle")?;

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().context("Failed to spawn detached driver")?;
    let pid = child.id();
    info!(pid, log = %log_file.display(), "driver detached");
    // Dropping the handle leaves the child running.
    drop(child);
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_line_parses_back() {
        let line = format_bootstrap(4242, Path::new("/home/me/.codeloop/logs/abc.log"));
        assert_eq!(
            line,
            "Background run started: pid=4242 log=/home/me/.codeloop/logs/abc.log"
        );
        let noisy = format!("warming up\n{}\n", line);
        assert_eq!(
            parse_bootstrap(&noisy),
            Some((4242, PathBuf::from("/home/me/.codeloop/logs/abc.log")))
        );
    }

    #[test]
    fn test_bootstrap_missing() {
        assert_eq!(parse_bootstrap("error: no prompt"), None);
        assert_eq!(parse_bootstrap(""), None);
    }
}
