//! Shared text helpers.

use regex::Regex;
use std::sync::LazyLock;

static PR_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s/]+/[^\s]+?/pull/(\d+)").unwrap());

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Find the first pull-request URL in `text`, with its number.
pub fn extract_pr_url(text: &str) -> Option<(String, u64)> {
    let caps = PR_URL_REGEX.captures(text)?;
    let url = caps.get(0)?.as_str().to_string();
    let number = caps.get(1)?.as_str().parse().ok()?;
    Some((url, number))
}

/// First non-empty line, truncated to `max_chars` characters.
pub fn first_line(text: &str, max_chars: usize) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    truncate_chars(line, max_chars)
}

/// Truncate on a character boundary, appending "..." when shortened.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
