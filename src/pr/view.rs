//! `gh pr view --json` output and its mapping onto [`MergeStatus`].

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use crate::run::MergeStatus;

/// Fields requested from `gh pr view --json`.
pub const VIEW_FIELDS: &str = "number,title,url,headRefName,baseRefName,state,mergeable,mergeStateStatus";

static PR_COORDINATES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^/\s]+/([^/\s]+)/([^/\s]+)/pull/(\d+)").unwrap());

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrView {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub head_ref_name: String,
    #[serde(default)]
    pub base_ref_name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub mergeable: String,
    #[serde(default)]
    pub merge_state_status: String,
}

impl PrView {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json.trim())
    }

    /// Merge status plus a human-readable explanation.
    pub fn classify(&self) -> (MergeStatus, String) {
        let state = self.state.to_ascii_uppercase();
        let mergeable = self.mergeable.to_ascii_uppercase();
        let merge_state = self.merge_state_status.to_ascii_uppercase();

        if state == "MERGED" {
            return (MergeStatus::Merged, "Pull request merged".to_string());
        }
        if state == "CLOSED" {
            return (
                MergeStatus::Failed,
                "Pull request was closed without merging".to_string(),
            );
        }
        if mergeable == "CONFLICTING" || merge_state == "DIRTY" {
            return (
                MergeStatus::Conflict,
                format!("Merge conflicts with {}", self.base_ref_name),
            );
        }
        if mergeable == "MERGEABLE" {
            let message = match merge_state.as_str() {
                "BLOCKED" => "Mergeable, blocked by branch protection",
                "BEHIND" => "Mergeable, branch is behind its base",
                "UNSTABLE" => "Mergeable, some checks are failing",
                _ => "Ready to merge",
            };
            return (MergeStatus::Ready, message.to_string());
        }
        (
            MergeStatus::Checking,
            "Mergeability is still being computed".to_string(),
        )
    }
}

/// `(owner, repo, number)` from a pull-request URL.
pub fn pr_coordinates(url: &str) -> Option<(String, String, u64)> {
    let caps = PR_COORDINATES_REGEX.captures(url.trim())?;
    Some((
        caps[1].to_string(),
        caps[2].to_string(),
        caps[3].parse().ok()?,
    ))
}
