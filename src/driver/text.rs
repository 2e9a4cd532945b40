//! Sanitizers for agent responses: branch slugs, review verdicts, commit
//! messages and PR text.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use crate::util::extract_json_object;

pub const FALLBACK_COMMIT_MESSAGE: &str = "apply automated changes";
pub const FALLBACK_PR_TITLE: &str = "Automated changes";
pub const FALLBACK_PR_BODY: &str = "This pull request was generated automatically by codeloop.";

const MAX_SLUG_TOKENS: usize = 3;
const MAX_TOKEN_CHARS: usize = 10;
const MAX_COMMIT_CHARS: usize = 72;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "for", "of", "to", "in", "on", "at", "by", "with",
    "from", "into", "this", "that", "these", "those", "it", "its", "is", "are", "was", "be",
    "as", "so", "some", "all", "please", "real", "time", "now", "just", "very", "really",
];

static COMMIT_MESSAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9 _/\-]*[a-z0-9]$").unwrap());

/// Sanitize free text into `<prefix><t1>-<t2>-<t3>`, or `None` if nothing
/// usable remains.
pub fn sanitize_slug(text: &str, prefix: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t))
        .take(MAX_SLUG_TOKENS)
        .map(|t| t.chars().take(MAX_TOKEN_CHARS).collect())
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(format!("{}{}", prefix, tokens.join("-")))
    }
}

/// Branch name used when slug generation fails.
pub fn fallback_branch(prefix: &str) -> String {
    format!("{}task-{}", prefix, chrono::Utc::now().timestamp())
}

/// Whether a review response, once cleaned, is exactly "LGTM".
pub fn is_lgtm(response: &str) -> bool {
    let without_fences: String = response
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join(" ");
    let mut cleaned = without_fences.as_str();
    loop {
        let next = cleaned
            .trim()
            .trim_matches(|c: char| matches!(c, '*' | '_' | '`' | '"' | '\'' | '>' | '~'))
            .trim_end_matches(|c: char| c.is_ascii_punctuation())
            .trim();
        if next == cleaned {
            break;
        }
        cleaned = next;
    }
    cleaned.eq_ignore_ascii_case("LGTM")
}

/// Whether `message` is an acceptable single-line commit subject.
pub fn is_valid_commit_message(message: &str) -> bool {
    if message.chars().count() > MAX_COMMIT_CHARS || !COMMIT_MESSAGE_REGEX.is_match(message) {
        return false;
    }
    let first = message.split_whitespace().next().unwrap_or("");
    !(first.ends_with("ed") || first.ends_with("ing"))
}

/// Clean an agent's commit message, falling back to the fixed literal.
pub fn commit_message(response: &str) -> String {
    let candidate = response
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("```"))
        .unwrap_or("")
        .trim_matches(|c: char| matches!(c, '`' | '"' | '\''))
        .trim();
    if is_valid_commit_message(candidate) {
        candidate.to_string()
    } else {
        FALLBACK_COMMIT_MESSAGE.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrText {
    pub title: String,
    pub body: String,
}

#[derive(Deserialize)]
struct RawPrText {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

/// Parse the agent's `{"title": ..., "body": ...}` reply, substituting
/// fixed literals for anything missing or unparsable.
pub fn parse_pr_text(response: &str) -> PrText {
    let raw = extract_json_object(response)
        .and_then(|json| serde_json::from_str::<RawPrText>(&json).ok());
    let (title, body) = match raw {
        Some(raw) => (raw.title, raw.body),
        None => (None, None),
    };
    let title = title
        .map(|t| t.lines().next().unwrap_or("").trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| FALLBACK_PR_TITLE.to_string());
    let body = body
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| FALLBACK_PR_BODY.to_string());
    PrText { title, body }
}
