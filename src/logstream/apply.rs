//! Phase-state inference from structured entries.
//!
//! Matching is by message prefix and is deliberately loose: a message the
//! rules don't recognize still activates its phase.

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::phase::PhaseStatus;
use crate::run::{DONE_TAG, LogEntry, PrState, Run};
use crate::util::extract_pr_url;

static COMPLETED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Completed in \d+(?:\.\d+)?s\b").unwrap());

static TOTAL_DURATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Total duration: (\d+)(?:\.\d+)?s").unwrap());

/// Update `run` for one entry, then append the entry to its log.
pub fn apply_entry(run: &mut Run, entry: &LogEntry) {
    if entry.phase_tag.eq_ignore_ascii_case(DONE_TAG) {
        if let Some(caps) = TOTAL_DURATION_REGEX.captures(&entry.message)
            && let Ok(secs) = caps[1].parse::<u64>()
        {
            run.phases.complete_active();
            run.total_duration_secs = Some(secs);
        }
    } else if let Some(phase) = entry.phase() {
        let message = entry.message.trim();
        if COMPLETED_REGEX.is_match(message) {
            run.phases.set(phase, PhaseStatus::Completed);
        } else if message.starts_with("Skipped") && phase.is_skippable() {
            run.phases.set(phase, PhaseStatus::Skipped);
        } else if let Some(reason) = message.strip_prefix("Failed:") {
            run.phases.set(phase, PhaseStatus::Failed);
            run.error = Some(reason.trim().to_string());
        } else {
            run.phases.activate(phase);
            apply_details(run, message);
        }
        run.current_phase = Some(phase);
    }
    run.push_log(entry.clone());
}

/// Values the Driver announces inside otherwise ordinary messages.
fn apply_details(run: &mut Run, message: &str) {
    if let Some(branch) = message.strip_prefix("Branch:") {
        run.branch_name = Some(branch.trim().to_string());
    } else if let Some(workspace) = message.strip_prefix("Workspace:") {
        run.workspace = Some(PathBuf::from(workspace.trim()));
    } else if let Some((url, number)) = extract_pr_url(message) {
        let known = run.pr.as_ref().is_some_and(|pr| pr.url == url);
        if !known {
            run.pr = Some(PrState::new(url, Some(number)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstream::parse_line;
    use crate::phase::{ALL_PHASES, Phase};
    use crate::run::{ExecutionMode, MergeStatus};

    fn run() -> Run {
        Run::new("/repo".into(), "task", ExecutionMode::Background)
    }

    fn apply(run: &mut Run, line: &str) {
        if let Some(entry) = parse_line(line) {
            apply_entry(run, &entry);
        }
    }

    #[test]
    fn test_done_line_completes_active_phase_and_records_duration() {
        let mut r = run();
        apply(&mut r, "[12:00:00] [PR] Opening pull request");
        apply(&mut r, "[12:00:00] [DONE] Total duration: 42s");
        assert_eq!(r.phases.get(Phase::Pr), PhaseStatus::Completed);
        assert_eq!(r.total_duration_secs, Some(42));
        assert!(r.done_seen());
    }

    #[test]
    fn test_fractional_completion() {
        let mut r = run();
        apply(&mut r, "[t] [SETUP] Running: npm ci");
        apply(&mut r, "[t] [SETUP] Completed in 3.5s");
        assert_eq!(r.phases.get(Phase::Setup), PhaseStatus::Completed);
    }

    #[test]
    fn test_skip_only_applies_to_skippable_phases() {
        let mut r = run();
        apply(&mut r, "[t] [PLAN] Skipped: planning disabled");
        apply(&mut r, "[t] [IMPLEMENT] Skipped for no reason");
        assert_eq!(r.phases.get(Phase::Plan), PhaseStatus::Skipped);
        assert_eq!(r.phases.get(Phase::Implement), PhaseStatus::Active);
    }

    #[test]
    fn test_failed_records_reason() {
        let mut r = run();
        apply(&mut r, "[t] [COMMIT] Committing changes");
        apply(&mut r, "[t] [COMMIT] Failed: nothing to commit");
        assert_eq!(r.phases.get(Phase::Commit), PhaseStatus::Failed);
        assert_eq!(r.error.as_deref(), Some("nothing to commit"));
        assert_eq!(r.phases.active_count(), 0);
    }

    #[test]
    fn test_details_populate_run() {
        let mut r = run();
        apply(&mut r, "[t] [CLONE] Workspace: /ws/run-1");
        apply(&mut r, "[t] [CLONE] Branch: codeloop/add-cache");
        apply(
            &mut r,
            "[t] [PR] Created pull request: https://github.com/acme/widgets/pull/9",
        );
        assert_eq!(r.workspace, Some(PathBuf::from("/ws/run-1")));
        assert_eq!(r.branch_name.as_deref(), Some("codeloop/add-cache"));
        let pr = r.pr.as_ref().unwrap();
        assert_eq!(pr.number, Some(9));
        assert_eq!(pr.merge_status, MergeStatus::Checking);
        assert_eq!(r.current_phase, Some(Phase::Pr));
    }

    #[test]
    fn test_seen_pr_url_keeps_merge_status() {
        let mut r = run();
        let line = "[t] [PR] Created pull request: https://github.com/a/b/pull/1";
        apply(&mut r, line);
        r.pr.as_mut().unwrap().merge_status = MergeStatus::Ready;
        apply(&mut r, line);
        assert_eq!(r.pr.as_ref().unwrap().merge_status, MergeStatus::Ready);
    }

    #[test]
    fn test_unknown_tags_have_no_phase_effect() {
        let mut r = run();
        apply(&mut r, "[t] [INFO] Completed in 1s");
        assert!(r.phases.iter().all(|(_, s)| s == PhaseStatus::Pending));
        assert_eq!(r.logs.len(), 1);
    }

    /// Deterministic stand-in for arbitrary interleavings of phase events.
    fn scrambled_lines(seed: u64, count: usize) -> Vec<String> {
        let messages = [
            "Starting",
            "Completed in 2s",
            "Skipped: disabled",
            "Failed: boom",
            "Transient failure (attempt 1/3), retrying in 2s: ECONNRESET",
        ];
        let mut state = seed;
        (0..count)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let phase = ALL_PHASES[(state >> 33) as usize % ALL_PHASES.len()];
                let message = messages[(state >> 17) as usize % messages.len()];
                format!("[t] [{}] {}", phase.tag(), message)
            })
            .collect()
    }

    #[test]
    fn test_phase_map_stays_total_with_at_most_one_active() {
        for seed in 0..64 {
            let mut r = run();
            for line in scrambled_lines(seed, 200) {
                apply(&mut r, &line);
                assert!(r.phases.is_total());
                assert!(r.phases.active_count() <= 1, "seed {}", seed);
            }
        }
    }

    #[test]
    fn test_replay_is_deterministic() {
        for seed in 0..16 {
            let lines = scrambled_lines(seed, 120);
            let mut first = run();
            let mut second = first.clone();
            for line in &lines {
                apply(&mut first, line);
            }
            for line in &lines {
                apply(&mut second, line);
            }
            assert_eq!(first, second);
        }
    }
}
