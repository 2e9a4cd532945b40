//! Process Supervisor: launches Driver processes, streams their output into
//! the registry, stops them, and adopts runs left behind by a previous
//! supervisor.
//!
//! Foreground runs are children whose stdout/stderr pipes feed the log
//! parser directly. Background runs detach; the supervisor only learns their
//! pid and log file from the bootstrap line and then tails the file by byte
//! offset until the pid disappears.

pub mod process;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::driver::background::parse_bootstrap;
use crate::errors::SupervisorError;
use crate::logstream::LogStreamParser;
use crate::notify::Notifier;
use crate::pr::PrManager;
use crate::registry::RunRegistry;
use crate::run::{ExecutionMode, LogEntry, Run, RunStatus};
use crate::util::first_line;
pub use process::{ProcessControl, SignalControl};

const STOP_POLL: Duration = Duration::from_millis(100);
const READ_BUFFER: usize = 8192;

/// How to invoke the Driver: a program plus the arguments that precede the
/// per-run flags.
#[derive(Debug, Clone)]
pub struct DriverCommand {
    pub program: PathBuf,
    pub base_args: Vec<String>,
}

impl DriverCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, base_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            base_args: base_args.into_iter().map(Into::into).collect(),
        }
    }

    /// This binary's `drive` subcommand, with `global_args` placed first.
    pub fn current_exe(global_args: Vec<String>) -> anyhow::Result<Self> {
        let program = std::env::current_exe()?;
        let mut base_args = global_args;
        base_args.push("drive".to_string());
        Ok(Self { program, base_args })
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub repo_path: PathBuf,
    pub prompt: String,
    pub mode: ExecutionMode,
    pub auto_merge: bool,
    pub skip_pr: bool,
    pub skip_plan: bool,
}

/// What startup adoption does with a background run whose process is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptMode {
    /// Keep tailing the log until the process exits.
    Tail,
    /// Read what is there now and leave the run running.
    CatchUp,
}

#[derive(Debug, Clone, Copy)]
struct ActiveRun {
    mode: ExecutionMode,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout = 0,
    Stderr = 1,
}

pub struct Supervisor {
    registry: Arc<RunRegistry>,
    settings: Arc<Settings>,
    driver: DriverCommand,
    control: Arc<dyn ProcessControl>,
    notifier: Notifier,
    pr: Option<Arc<PrManager>>,
    active: DashMap<String, ActiveRun>,
    finished: Notify,
    /// Runs with an auto-merge task in flight in this process.
    merging: DashSet<String>,
    followups: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(registry: Arc<RunRegistry>, settings: Arc<Settings>, driver: DriverCommand) -> Self {
        let notifier = Notifier::new(settings.general.notifications);
        Self {
            registry,
            settings,
            driver,
            control: Arc::new(SignalControl),
            notifier,
            pr: None,
            active: DashMap::new(),
            finished: Notify::new(),
            merging: DashSet::new(),
            followups: Mutex::new(Vec::new()),
        }
    }

    pub fn with_process_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.control = control;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// PR manager used for the auto-merge follow-up of completed runs.
    pub fn with_pr_manager(mut self, pr: Arc<PrManager>) -> Self {
        self.pr = Some(pr);
        self
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    /// Register a new Run and launch its Driver.
    pub async fn start(self: &Arc<Self>, request: LaunchRequest) -> Result<Run, SupervisorError> {
        let mut run = Run::new(request.repo_path.clone(), request.prompt.clone(), request.mode);
        run.auto_merge = request.auto_merge;
        run.skip_pr = request.skip_pr;
        let run = self.registry.insert(run);
        info!(run_id = %run.id, mode = request.mode.as_str(), "starting run");

        let mut args = self.driver.base_args.clone();
        args.extend(driver_args(&run, &request));

        let launched = match request.mode {
            ExecutionMode::Foreground => self.launch_foreground(&run.id, args),
            ExecutionMode::Background => self.launch_background(&run.id, args).await,
        };
        if let Err(e) = launched {
            error!(run_id = %run.id, error = %e, "launch failed");
            self.finalize(&run.id, RunStatus::Failed, Some(e.to_string()));
            return Err(e);
        }
        Ok(self.registry.get(&run.id).unwrap_or(run))
    }

    fn launch_foreground(self: &Arc<Self>, id: &str, args: Vec<String>) -> Result<(), SupervisorError> {
        let mut cmd = Command::new(&self.driver.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(SupervisorError::SpawnFailed)?;
        let pid = child.id();
        self.registry.mutate(id, |run| run.pid = pid);
        self.active.insert(
            id.to_string(),
            ActiveRun {
                mode: ExecutionMode::Foreground,
            },
        );
        debug!(run_id = %id, pid = ?pid, "foreground driver spawned");

        let this = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move { this.supervise_foreground(id, child).await });
        Ok(())
    }

    async fn supervise_foreground(self: Arc<Self>, id: String, mut child: Child) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut parsers = [LogStreamParser::new(), LogStreamParser::new()];
        while let Some((stream, chunk)) = rx.recv().await {
            let parser = &mut parsers[stream as usize];
            self.apply_with(&id, |run| parser.apply_bytes(run, &chunk));
        }
        for parser in &mut parsers {
            self.apply_with(&id, |run| parser.finish(run));
        }

        let (status, fallback) = match child.wait().await {
            Ok(exit) if exit.success() => (RunStatus::Completed, None),
            Ok(exit) => (
                RunStatus::Failed,
                Some(match exit.code() {
                    Some(code) => format!("driver exited with code {}", code),
                    None => "driver terminated by signal".to_string(),
                }),
            ),
            Err(e) => (RunStatus::Failed, Some(format!("failed to wait for driver: {}", e))),
        };
        // A `Failed:` line already recorded the precise reason.
        let has_reason = self
            .registry
            .get(&id)
            .is_some_and(|run| run.error.is_some());
        let error = if has_reason { None } else { fallback };
        self.finalize(&id, status, error);
    }

    async fn launch_background(
        self: &Arc<Self>,
        id: &str,
        mut args: Vec<String>,
    ) -> Result<(), SupervisorError> {
        let log_file = self.settings.run_log_file(id);
        args.extend([
            "--background".to_string(),
            "--log-file".to_string(),
            log_file.display().to_string(),
        ]);

        let output = Command::new(&self.driver.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(SupervisorError::SpawnFailed)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some((pid, log)) = parse_bootstrap(&stdout) else {
            let combined = format!("{}{}", stdout, String::from_utf8_lossy(&output.stderr));
            return Err(SupervisorError::MissingBootstrap {
                output: first_line(combined.trim(), 300),
            });
        };
        info!(run_id = %id, pid, log = %log.display(), "background driver detached");

        self.registry.mutate(id, |run| {
            run.pid = Some(pid);
            run.log_file = Some(log);
            run.log_offset = 0;
        });
        self.spawn_tail(id);
        Ok(())
    }

    fn spawn_tail(self: &Arc<Self>, id: &str) {
        self.active.insert(
            id.to_string(),
            ActiveRun {
                mode: ExecutionMode::Background,
            },
        );
        let this = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move { this.tail(id).await });
    }

    /// Poll the log file until the process is gone, then finalize.
    async fn tail(self: Arc<Self>, id: String) {
        let mut parser = LogStreamParser::new();
        let mut ticker = tokio::time::interval(self.settings.timing.tail_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(run) = self.registry.get(&id) else {
                break;
            };
            // Liveness first, so the read after death sees every byte.
            let alive = run.pid.is_some_and(|pid| self.control.is_alive(pid));
            if let Err(e) = self.read_log(&id, &mut parser).await {
                warn!(run_id = %id, error = %e, "log tail read failed");
            }
            if !alive {
                self.finish_log(&id, &mut parser);
                let (status, error) = match self.registry.get(&id) {
                    Some(run) if run.done_seen() => (RunStatus::Completed, None),
                    _ => (
                        RunStatus::Failed,
                        Some("process exited without completing".to_string()),
                    ),
                };
                self.finalize(&id, status, error);
                break;
            }
        }
        self.mark_inactive(&id);
    }

    /// Apply bytes appended to the run's log file since the last read.
    async fn read_log(&self, id: &str, parser: &mut LogStreamParser) -> Result<(), SupervisorError> {
        let Some(run) = self.registry.get(id) else {
            return Ok(());
        };
        let Some(path) = run.log_file else {
            return Ok(());
        };
        let start = run.log_offset + parser.pending() as u64;
        let bytes = match read_from(&path, start).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(SupervisorError::LogRead { path, source }),
        };
        if bytes.is_empty() {
            return Ok(());
        }
        let len = bytes.len() as u64;
        self.apply_with(id, |run| {
            let entries = parser.apply_bytes(run, &bytes);
            run.log_offset = start + len - parser.pending() as u64;
            entries
        });
        Ok(())
    }

    /// Flush a trailing partial line and account for its bytes.
    fn finish_log(&self, id: &str, parser: &mut LogStreamParser) {
        let pending = parser.pending() as u64;
        self.apply_with(id, |run| {
            run.log_offset += pending;
            parser.finish(run)
        });
    }

    fn apply_with(&self, id: &str, f: impl FnOnce(&mut Run) -> Vec<LogEntry>) {
        if let Some((_, entries)) = self.registry.mutate(id, f) {
            self.registry.publish_logs(id, entries);
        }
    }

    /// Move a run to its terminal status, unless it already has one, and
    /// kick the notification and auto-merge follow-ups.
    fn finalize(self: &Arc<Self>, id: &str, status: RunStatus, error: Option<String>) {
        let changed = self.registry.mutate(id, |run| {
            let changed = run.finish(status, error);
            if changed && run.status == RunStatus::Completed && run.auto_merge && run.pr.is_some() {
                run.auto_merge_pending = true;
            }
            changed
        });
        self.mark_inactive(id);
        let Some((run, true)) = changed else {
            return;
        };
        info!(run_id = %id, status = run.status.as_str(), "run finished");
        self.notifier.run_finished(&run);

        if run.auto_merge_pending {
            self.spawn_auto_merge(id);
        }
    }

    /// Start the auto-merge follow-up unless one is already running here.
    fn spawn_auto_merge(self: &Arc<Self>, id: &str) {
        let Some(pr) = self.pr.clone() else {
            return;
        };
        if !self.merging.insert(id.to_string()) {
            return;
        }
        let this = Arc::clone(self);
        let id = id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = pr.auto_merge(&id).await {
                warn!(run_id = %id, error = %e, "auto-merge failed");
            }
            this.merging.remove(&id);
        });
        if let Ok(mut followups) = self.followups.lock() {
            followups.push(handle);
        }
    }

    fn mark_inactive(&self, id: &str) {
        if self.active.remove(id).is_some() {
            self.finished.notify_waiters();
        }
    }

    /// Wait until the run has no supervising task.
    pub async fn wait(&self, id: &str) {
        loop {
            let notified = self.finished.notified();
            if !self.active.contains_key(id) {
                return;
            }
            notified.await;
        }
    }

    /// Wait for auto-merge follow-ups started so far.
    pub async fn wait_followups(&self) {
        let handles: Vec<_> = match self.followups.lock() {
            Ok(mut followups) => followups.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Stop a running run: status flips to stopped at once, then SIGTERM to
    /// the process group, then SIGKILL if it outlives the grace window.
    pub async fn stop(&self, id_or_prefix: &str) -> Result<Run, SupervisorError> {
        let run = self
            .registry
            .find(id_or_prefix)
            .ok_or_else(|| SupervisorError::RunNotFound {
                id: id_or_prefix.to_string(),
            })?;
        if run.status.is_terminal() {
            return Err(SupervisorError::NotRunning { id: run.id });
        }
        let id = run.id.clone();
        let entry = LogEntry::synthetic("Stop requested");
        let Some((run, _)) = self.registry.mutate(&id, |run| {
            run.push_log(entry.clone());
            run.finish(RunStatus::Stopped, Some("stopped by user".to_string()))
        }) else {
            return Err(SupervisorError::RunNotFound { id });
        };
        self.registry.publish_logs(&id, vec![entry]);
        info!(run_id = %id, "stop requested");

        let Some(pid) = run.pid else {
            return Ok(run);
        };
        if let Err(e) = self.control.graceful(pid) {
            debug!(run_id = %id, error = %e, "graceful signal failed");
        }
        self.escalate(&id, pid).await;
        Ok(self.registry.get(&id).unwrap_or(run))
    }

    /// After SIGTERM: wait out the grace window, then SIGKILL if still running.
    async fn escalate(&self, id: &str, pid: u32) {
        let deadline = Instant::now() + self.settings.timing.stop_grace();
        while self.process_running(id, pid) && Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL).await;
        }
        if self.process_running(id, pid) {
            warn!(run_id = %id, pid, "driver ignored SIGTERM, forcing kill");
            if let Err(e) = self.control.forced(pid) {
                debug!(run_id = %id, error = %e, "forced kill failed");
            }
        }
    }

    fn process_running(&self, id: &str, pid: u32) -> bool {
        let mode = self.active.get(id).map(|a| a.mode);
        match mode {
            // The pipe consumer removes the entry once the child is reaped.
            Some(ExecutionMode::Foreground) => true,
            _ => self.control.is_alive(pid),
        }
    }

    /// Re-examine every persisted running run that nothing supervises, and
    /// restart auto-merge attempts a previous host never finished.
    /// Returns the number of running runs looked at.
    pub async fn adopt_orphans(self: &Arc<Self>, mode: AdoptMode) -> usize {
        let orphans: Vec<Run> = self
            .registry
            .list()
            .into_iter()
            .filter(|run| run.status == RunStatus::Running && !self.is_active(&run.id))
            .collect();
        for run in &orphans {
            self.adopt(run, mode).await;
        }
        for run in self.registry.list() {
            if run.status == RunStatus::Completed && run.auto_merge_pending {
                info!(run_id = %run.id, "resuming auto-merge");
                self.spawn_auto_merge(&run.id);
            }
        }
        orphans.len()
    }

    async fn adopt(self: &Arc<Self>, run: &Run, mode: AdoptMode) {
        let alive = run.mode == ExecutionMode::Background
            && run.log_file.is_some()
            && run.pid.is_some_and(|pid| self.control.is_alive(pid));
        let mut parser = LogStreamParser::new();

        if alive {
            match mode {
                AdoptMode::Tail => {
                    info!(run_id = %run.id, "resuming log tail");
                    self.spawn_tail(&run.id);
                }
                AdoptMode::CatchUp => {
                    if let Err(e) = self.read_log(&run.id, &mut parser).await {
                        warn!(run_id = %run.id, error = %e, "log catch-up failed");
                    }
                }
            }
            return;
        }

        // A foreground driver outlives its host only if the host was killed
        // before `kill_on_drop` ran. Signal errors are ignored: the run is
        // about to be terminal either way.
        if run.mode == ExecutionMode::Foreground
            && let Some(pid) = run.pid
            && self.control.is_alive(pid)
        {
            match self.control.graceful(pid) {
                Ok(()) => {
                    warn!(run_id = %run.id, pid, "terminating driver left by a previous host");
                    self.escalate(&run.id, pid).await;
                }
                Err(e) => debug!(run_id = %run.id, error = %e, "orphan driver not signalled"),
            }
        }

        if let Err(e) = self.read_log(&run.id, &mut parser).await {
            warn!(run_id = %run.id, error = %e, "log catch-up failed");
        }
        self.finish_log(&run.id, &mut parser);
        if self.registry.get(&run.id).is_some_and(|r| r.done_seen()) {
            self.finalize(&run.id, RunStatus::Completed, None);
            return;
        }
        let entry = LogEntry::synthetic("Driver process is no longer running; marking run stopped");
        let stopped = self.registry.mutate(&run.id, |r| {
            r.push_log(entry.clone());
            r.finish(
                RunStatus::Stopped,
                Some("driver process is no longer running".to_string()),
            )
        });
        if stopped.is_some() {
            self.registry.publish_logs(&run.id, vec![entry]);
            info!(run_id = %run.id, "orphaned run marked stopped");
        }
    }
}

/// Per-run flags appended after the driver's base arguments.
fn driver_args(run: &Run, request: &LaunchRequest) -> Vec<String> {
    let mut args = vec![
        "--run-id".to_string(),
        run.id.clone(),
        "--repo".to_string(),
        run.repo_path.display().to_string(),
        format!("--prompt={}", run.prompt),
    ];
    if request.skip_pr {
        args.push("--skip-pr".to_string());
    }
    if request.skip_plan {
        args.push("--skip-plan".to_string());
    }
    args
}

async fn read_from(path: &std::path::Path, start: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

async fn pump<R>(mut reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "driver pipe read failed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::driver::testing::{ScriptedRunner, ok};
    use crate::phase::{Phase, PhaseStatus};
    use crate::pr::tests::{URL, view_json};
    use crate::run::{MergeStatus, PrState};
    use std::path::Path;
    use tempfile::TempDir;

    struct RecordingControl {
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingControl {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProcessControl for RecordingControl {
        fn graceful(&self, pid: u32) -> Result<(), SupervisorError> {
            self.calls.lock().unwrap().push("graceful");
            SignalControl.graceful(pid)
        }

        fn forced(&self, pid: u32) -> Result<(), SupervisorError> {
            self.calls.lock().unwrap().push("forced");
            SignalControl.forced(pid)
        }

        fn is_alive(&self, pid: u32) -> bool {
            SignalControl.is_alive(pid)
        }
    }

    fn settings(dir: &TempDir) -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.state_dir = dir.path().to_path_buf();
        settings.timing.tail_interval_ms = 20;
        settings.timing.stop_grace_ms = 300;
        Arc::new(settings)
    }

    fn build(dir: &TempDir, script: &str) -> Supervisor {
        let settings = settings(dir);
        let registry =
            RunRegistry::open(&settings.registry_path(), Duration::from_millis(5)).unwrap();
        Supervisor::new(
            registry,
            settings,
            DriverCommand::new("sh", ["-c", script, "sh"]),
        )
    }

    fn supervisor(dir: &TempDir, script: &str) -> Arc<Supervisor> {
        Arc::new(build(dir, script))
    }

    /// Supervisor whose auto-merge follow-ups talk to a scripted `gh`.
    fn merging_supervisor(dir: &TempDir) -> (Arc<Supervisor>, Arc<ScriptedRunner>) {
        let sup = build(dir, "true");
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("gh pr view", ok(&view_json("MERGEABLE", "CLEAN")));
        let pr = PrManager::new(runner.clone(), sup.registry().clone(), sup.settings.clone());
        (Arc::new(sup.with_pr_manager(Arc::new(pr))), runner)
    }

    fn request(mode: ExecutionMode) -> LaunchRequest {
        LaunchRequest {
            repo_path: "/repo".into(),
            prompt: "Add caching".into(),
            mode,
            auto_merge: false,
            skip_pr: true,
            skip_plan: false,
        }
    }

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    fn orphan(sup: &Supervisor, log: &Path, pid: u32, lines: &str) -> String {
        std::fs::write(log, lines).unwrap();
        let mut run = Run::new("/repo".into(), "task", ExecutionMode::Background);
        run.pid = Some(pid);
        run.log_file = Some(log.to_path_buf());
        sup.registry().insert(run).id
    }

    #[tokio::test]
    async fn test_foreground_run_completes_from_stream() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(
            &dir,
            "echo '[2026-01-01 10:00:00] [CLONE] Workspace: /tmp/w'; \
             echo 'agent chatter' >&2; \
             echo '[2026-01-01 10:00:01] [CLONE] Completed in 1s'; \
             printf '[2026-01-01 10:00:02] [DONE] Total duration: 2s'",
        );
        let run = sup.start(request(ExecutionMode::Foreground)).await.unwrap();
        assert!(run.pid.is_some());
        sup.wait(&run.id).await;

        let run = sup.registry().get(&run.id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.phases.get(Phase::Clone), PhaseStatus::Completed);
        assert_eq!(run.workspace, Some(PathBuf::from("/tmp/w")));
        assert_eq!(run.total_duration_secs, Some(2));
        assert_eq!(run.logs.len(), 4);
        assert!(run.logs.iter().any(|e| e.message == "agent chatter"));
    }

    #[tokio::test]
    async fn test_foreground_failure_keeps_failed_reason() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(
            &dir,
            "echo '[2026-01-01 10:00:00] [COMMIT] Failed: nothing to commit'; exit 3",
        );
        let run = sup.start(request(ExecutionMode::Foreground)).await.unwrap();
        sup.wait(&run.id).await;
        let run = sup.registry().get(&run.id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("nothing to commit"));
        assert_eq!(run.phases.get(Phase::Commit), PhaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_foreground_exit_code_without_reason() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "exit 1");
        let run = sup.start(request(ExecutionMode::Foreground)).await.unwrap();
        sup.wait(&run.id).await;
        let run = sup.registry().get(&run.id).unwrap();
        assert_eq!(run.error.as_deref(), Some("driver exited with code 1"));
    }

    #[tokio::test]
    async fn test_stop_escalates_when_sigterm_is_ignored() {
        let dir = TempDir::new().unwrap();
        let control = RecordingControl::new();
        let sup = Arc::new(
            build(&dir, "trap '' TERM; sleep 30").with_process_control(control.clone()),
        );
        let run = sup.start(request(ExecutionMode::Foreground)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopped = sup.stop(&run.id[..8]).await.unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert_eq!(control.calls(), vec!["graceful", "forced"]);

        sup.wait(&run.id).await;
        let run = sup.registry().get(&run.id).unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(run.error.as_deref(), Some("stopped by user"));
        assert!(run.logs.iter().any(|e| e.message == "Stop requested"));

        assert!(matches!(
            sup.stop(&run.id).await,
            Err(SupervisorError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_background_launch_tails_log_file() {
        let dir = TempDir::new().unwrap();
        let pid = dead_pid();
        let script = format!(
            "for a; do log=$a; done; mkdir -p \"$(dirname \"$log\")\"; \
             printf '[2026-01-01 10:00:00] [CLONE] Completed in 1s\\n[2026-01-01 10:00:05] [DONE] Total duration: 5s\\n' > \"$log\"; \
             echo \"Background run started: pid={} log=$log\"",
            pid
        );
        let sup = supervisor(&dir, &script);
        let run = sup.start(request(ExecutionMode::Background)).await.unwrap();
        assert_eq!(run.pid, Some(pid));
        assert_eq!(run.log_file, Some(dir.path().join("logs").join(format!("{}.log", run.id))));

        sup.wait(&run.id).await;
        let run = sup.registry().get(&run.id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_duration_secs, Some(5));
        let len = std::fs::metadata(run.log_file.as_ref().unwrap()).unwrap().len();
        assert_eq!(run.log_offset, len);
    }

    #[tokio::test]
    async fn test_background_launch_without_bootstrap_fails_run() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "echo 'something else'");
        let err = sup.start(request(ExecutionMode::Background)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::MissingBootstrap { .. }));
        let runs = sup.registry().list();
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_tail_follows_live_process_and_partial_lines() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "true");
        let log = dir.path().join("live.log");
        let id = orphan(&sup, &log, std::process::id(), "[t] [CLONE] Cloning\n[t] [SET");

        assert_eq!(sup.adopt_orphans(AdoptMode::Tail).await, 1);
        assert!(sup.is_active(&id));
        wait_for(|| sup.registry().get(&id).unwrap().logs.len() == 1).await;
        assert_eq!(sup.registry().get(&id).unwrap().log_offset, 20);

        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        std::io::Write::write_all(&mut file, b"UP] Running: npm ci\n").unwrap();
        wait_for(|| sup.registry().get(&id).unwrap().logs.len() == 2).await;
        let run = sup.registry().get(&id).unwrap();
        assert_eq!(run.phases.get(Phase::Setup), PhaseStatus::Active);
        assert_eq!(run.status, RunStatus::Running);

        sup.registry().mutate(&id, |r| r.pid = Some(dead_pid()));
        sup.wait(&id).await;
        let run = sup.registry().get(&id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("process exited without completing"));
    }

    #[tokio::test]
    async fn test_dead_orphan_with_done_completes() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "true");
        let id = orphan(
            &sup,
            &dir.path().join("done.log"),
            dead_pid(),
            "[12:00:00] [PR] Created pull request: https://github.com/a/b/pull/7\n[12:00:01] [DONE] Total duration: 42s",
        );
        sup.adopt_orphans(AdoptMode::CatchUp).await;
        let run = sup.registry().get(&id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_duration_secs, Some(42));
        assert_eq!(run.pr.map(|p| p.number), Some(Some(7)));
    }

    #[tokio::test]
    async fn test_dead_orphan_without_done_is_stopped() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "true");
        let id = orphan(
            &sup,
            &dir.path().join("cut.log"),
            dead_pid(),
            "[12:00:00] [IMPLEMENT] Implementing\n",
        );
        sup.adopt_orphans(AdoptMode::Tail).await;
        let run = sup.registry().get(&id).unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(run.phases.get(Phase::Implement), PhaseStatus::Failed);
        assert!(run.logs.back().unwrap().message.contains("no longer running"));
        assert!(!sup.is_active(&id));
    }

    #[tokio::test]
    async fn test_catch_up_leaves_live_run_running() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "true");
        let id = orphan(
            &sup,
            &dir.path().join("live.log"),
            std::process::id(),
            "[12:00:00] [PLAN] Planning\n",
        );
        sup.adopt_orphans(AdoptMode::CatchUp).await;
        let run = sup.registry().get(&id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.phases.get(Phase::Plan), PhaseStatus::Active);
        assert!(!sup.is_active(&id));
    }

    #[tokio::test]
    async fn test_completed_orphan_runs_auto_merge_before_returning() {
        let dir = TempDir::new().unwrap();
        let (sup, runner) = merging_supervisor(&dir);
        let id = orphan(
            &sup,
            &dir.path().join("done.log"),
            dead_pid(),
            "[12:00:00] [PR] Created pull request: https://github.com/a/b/pull/7\n[12:00:01] [DONE] Total duration: 42s\n",
        );
        sup.registry().mutate(&id, |r| r.auto_merge = true);

        sup.adopt_orphans(AdoptMode::CatchUp).await;
        sup.wait_followups().await;

        let run = sup.registry().get(&id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(!run.auto_merge_pending);
        assert_eq!(run.pr.unwrap().merge_status, MergeStatus::Merged);
        assert_eq!(runner.count("gh pr merge"), 1);
    }

    #[tokio::test]
    async fn test_unfinished_auto_merge_resumes_once() {
        let dir = TempDir::new().unwrap();
        let (sup, runner) = merging_supervisor(&dir);
        let mut run = Run::new("/repo".into(), "task", ExecutionMode::Background);
        run.finish(RunStatus::Completed, None);
        run.auto_merge = true;
        run.auto_merge_pending = true;
        run.pr = Some(PrState::new(URL, Some(12)));
        let id = sup.registry().insert(run).id;

        assert_eq!(sup.adopt_orphans(AdoptMode::CatchUp).await, 0);
        sup.wait_followups().await;
        assert_eq!(runner.count("gh pr merge"), 1);
        assert!(!sup.registry().get(&id).unwrap().auto_merge_pending);

        sup.adopt_orphans(AdoptMode::CatchUp).await;
        sup.wait_followups().await;
        assert_eq!(runner.count("gh pr merge"), 1);
    }

    #[tokio::test]
    async fn test_live_foreground_orphan_is_terminated() {
        use std::os::unix::process::CommandExt;

        let dir = TempDir::new().unwrap();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait().unwrap());

        let control = RecordingControl::new();
        let sup = Arc::new(build(&dir, "true").with_process_control(control.clone()));
        let mut run = Run::new("/repo".into(), "task", ExecutionMode::Foreground);
        run.pid = Some(pid);
        let id = sup.registry().insert(run).id;

        sup.adopt_orphans(AdoptMode::CatchUp).await;

        assert_eq!(control.calls().first(), Some(&"graceful"));
        let run = sup.registry().get(&id).unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert!(!reaper.join().unwrap().success());
    }

    #[tokio::test]
    async fn test_tail_adoption_watches_orphan_until_exit() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "true");
        let mut child = std::process::Command::new("sleep").arg("0.3").spawn().unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait().unwrap());
        let id = orphan(
            &sup,
            &dir.path().join("bg.log"),
            pid,
            "[12:00:00] [PLAN] Planning\n[12:00:09] [DONE] Total duration: 9s\n",
        );

        sup.adopt_orphans(AdoptMode::Tail).await;
        assert!(sup.is_active(&id));
        assert_eq!(sup.registry().get(&id).unwrap().status, RunStatus::Running);

        reaper.join().unwrap();
        sup.wait(&id).await;
        let run = sup.registry().get(&id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_duration_secs, Some(9));
    }
}
