//! The nine fixed pipeline phases and their per-run status.
//!
//! Phases run in strict order. The wire tag (`CLONE`, `PLAN`, ...) is what the
//! Driver prints inside the second bracket of every structured log line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One stage of the pipeline, ordered by execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Clone,
    Setup,
    Plan,
    Implement,
    Review,
    Fix,
    Commit,
    Push,
    Pr,
}

/// Every phase in execution order.
pub const ALL_PHASES: [Phase; 9] = [
    Phase::Clone,
    Phase::Setup,
    Phase::Plan,
    Phase::Implement,
    Phase::Review,
    Phase::Fix,
    Phase::Commit,
    Phase::Push,
    Phase::Pr,
];

impl Phase {
    /// Upper-case tag used in structured log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Clone => "CLONE",
            Self::Setup => "SETUP",
            Self::Plan => "PLAN",
            Self::Implement => "IMPLEMENT",
            Self::Review => "REVIEW",
            Self::Fix => "FIX",
            Self::Commit => "COMMIT",
            Self::Push => "PUSH",
            Self::Pr => "PR",
        }
    }

    /// Look up a phase by its wire tag (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        ALL_PHASES
            .iter()
            .copied()
            .find(|p| p.tag().eq_ignore_ascii_case(tag.trim()))
    }

    /// Whether a `Skipped` message may mark this phase skipped.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Plan | Self::Fix | Self::Push | Self::Pr)
    }

    /// Zero-based position in the pipeline.
    pub fn index(&self) -> usize {
        ALL_PHASES.iter().position(|p| p == self).unwrap_or(0)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| format!("Invalid phase: {}", s))
    }
}

/// Status of one phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Skipped,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Phase → status map that stays total over [`ALL_PHASES`] and never holds
/// more than one `Active` phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<Phase, PhaseStatus>", into = "BTreeMap<Phase, PhaseStatus>")]
pub struct PhaseMap {
    statuses: BTreeMap<Phase, PhaseStatus>,
}

impl Default for PhaseMap {
    fn default() -> Self {
        Self {
            statuses: ALL_PHASES
                .iter()
                .map(|p| (*p, PhaseStatus::Pending))
                .collect(),
        }
    }
}

impl From<BTreeMap<Phase, PhaseStatus>> for PhaseMap {
    /// Backfills missing phases as pending and keeps only the latest active
    /// phase, so maps written by older versions load into a valid state.
    fn from(mut statuses: BTreeMap<Phase, PhaseStatus>) -> Self {
        for phase in ALL_PHASES {
            statuses.entry(phase).or_insert(PhaseStatus::Pending);
        }
        let active: Vec<Phase> = statuses
            .iter()
            .filter(|(_, s)| **s == PhaseStatus::Active)
            .map(|(p, _)| *p)
            .collect();
        if let Some((_, earlier)) = active.split_last() {
            for phase in earlier {
                statuses.insert(*phase, PhaseStatus::Completed);
            }
        }
        Self { statuses }
    }
}

impl From<PhaseMap> for BTreeMap<Phase, PhaseStatus> {
    fn from(map: PhaseMap) -> Self {
        map.statuses
    }
}

impl PhaseMap {
    pub fn get(&self, phase: Phase) -> PhaseStatus {
        self.statuses.get(&phase).copied().unwrap_or_default()
    }

    /// Currently active phase, if any.
    pub fn active(&self) -> Option<Phase> {
        self.statuses
            .iter()
            .find(|(_, s)| **s == PhaseStatus::Active)
            .map(|(p, _)| *p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Phase, PhaseStatus)> + '_ {
        self.statuses.iter().map(|(p, s)| (*p, *s))
    }

    /// Mark `phase` active, demoting any other active phase to completed.
    /// Skipped phases are immutable and the call is a no-op for them.
    pub fn activate(&mut self, phase: Phase) -> bool {
        if self.get(phase) == PhaseStatus::Skipped {
            return false;
        }
        if let Some(current) = self.active()
            && current != phase
        {
            self.statuses.insert(current, PhaseStatus::Completed);
        }
        self.statuses.insert(phase, PhaseStatus::Active);
        true
    }

    /// Set a terminal status (`Completed`, `Skipped`, `Failed`) on `phase`.
    /// Returns false if the phase was already skipped.
    pub fn set(&mut self, phase: Phase, status: PhaseStatus) -> bool {
        if status == PhaseStatus::Active {
            return self.activate(phase);
        }
        if self.get(phase) == PhaseStatus::Skipped {
            return false;
        }
        self.statuses.insert(phase, status);
        true
    }

    /// Complete every phase that is still active.
    pub fn complete_active(&mut self) {
        for status in self.statuses.values_mut() {
            if *status == PhaseStatus::Active {
                *status = PhaseStatus::Completed;
            }
        }
    }

    /// Fail whichever phase is still active, used when a run stops or dies.
    pub fn fail_active(&mut self) -> Option<Phase> {
        let active = self.active()?;
        self.statuses.insert(active, PhaseStatus::Failed);
        Some(active)
    }

    pub fn is_total(&self) -> bool {
        ALL_PHASES.iter().all(|p| self.statuses.contains_key(p)) && self.statuses.len() == 9
    }

    pub fn active_count(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| **s == PhaseStatus::Active)
            .count()
    }
}
