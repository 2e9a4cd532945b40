//! Desktop notifications when a run finishes.

use crate::run::{Run, RunStatus};

/// Summary and body for a finished run, or `None` for runs that do not
/// notify (still running, or stopped by the user).
pub fn run_message(run: &Run) -> Option<(String, String)> {
    let task = crate::util::first_line(&run.prompt, 60);
    match run.status {
        RunStatus::Completed => {
            let body = match (&run.pr, run.total_duration_secs) {
                (Some(pr), _) => format!("Pull request ready: {}", pr.url),
                (None, Some(secs)) => format!("Completed in {}s", secs),
                (None, None) => "Completed".to_string(),
            };
            Some((format!("codeloop: {}", task), body))
        }
        RunStatus::Failed => {
            let body = run
                .error
                .as_deref()
                .map(|e| format!("Failed: {}", crate::util::first_line(e, 120)))
                .unwrap_or_else(|| "Failed".to_string());
            Some((format!("codeloop: {}", task), body))
        }
        RunStatus::Running | RunStatus::Stopped => None,
    }
}

/// Sends at most one notification per finished run when enabled.
#[derive(Debug, Clone, Copy)]
pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn run_finished(&self, run: &Run) {
        if !self.enabled {
            return;
        }
        if let Some((summary, body)) = run_message(run) {
            send_notification(&summary, &body, run.status == RunStatus::Completed);
        }
    }
}

#[cfg(feature = "notifications")]
fn send_notification(summary: &str, body: &str, success: bool) {
    use notify_rust::Notification;

    let icon = if success { "dialog-information" } else { "dialog-error" };
    if let Err(e) = Notification::new()
        .summary(summary)
        .body(body)
        .icon(icon)
        .appname("codeloop")
        .timeout(5000)
        .show()
    {
        tracing::debug!(error = %e, "desktop notification failed");
    }
}

/// No-op notification when feature is disabled.
#[cfg(not(feature = "notifications"))]
fn send_notification(_summary: &str, _body: &str, _success: bool) {}
