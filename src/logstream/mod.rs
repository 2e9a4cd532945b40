//! Log Stream Parser: Driver output → Run state.
//!
//! The same path serves a live foreground pipe and a background log file
//! tailed by byte offset. Bytes are framed into lines, terminal escapes are
//! stripped, and each non-blank line becomes a [`LogEntry`] that is applied to
//! the Run.

mod apply;
pub mod framing;

pub use apply::apply_entry;
pub use framing::{LineFramer, strip_ansi};

use regex::Regex;
use std::sync::LazyLock;

use crate::run::{LogEntry, Run};

static STRUCTURED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]\s+\[([A-Za-z_-]+)\]\s?(.*)$").unwrap());

/// Parse one line. Blank lines yield `None`; lines not in the structured
/// `[timestamp] [PHASE] message` shape become `OUTPUT` entries.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let clean = strip_ansi(line);
    let trimmed = clean.trim();
    if trimmed.is_empty() {
        return None;
    }
    match STRUCTURED_REGEX.captures(trimmed) {
        Some(caps) => Some(LogEntry {
            timestamp: caps[1].trim().to_string(),
            phase_tag: caps[2].to_ascii_uppercase(),
            message: caps[3].trim_end().to_string(),
            raw: trimmed.to_string(),
        }),
        None => Some(LogEntry::synthetic(trimmed)),
    }
}

/// Stateful parser for one stream: framing plus entry application.
#[derive(Debug, Default)]
pub struct LogStreamParser {
    framer: LineFramer,
}

impl LogStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every complete line in `chunk` to `run`, in order. Returns the
    /// entries applied.
    pub fn apply_bytes(&mut self, run: &mut Run, chunk: &[u8]) -> Vec<LogEntry> {
        let lines = self.framer.push(chunk);
        apply_lines(run, lines)
    }

    /// Flush a trailing partial line at end of stream.
    pub fn finish(&mut self, run: &mut Run) -> Vec<LogEntry> {
        apply_lines(run, self.framer.finish())
    }

    /// Bytes received but not yet applied.
    pub fn pending(&self) -> usize {
        self.framer.pending()
    }
}

fn apply_lines(run: &mut Run, lines: impl IntoIterator<Item = String>) -> Vec<LogEntry> {
    let mut applied = Vec::new();
    for line in lines {
        if let Some(entry) = parse_line(&line) {
            apply_entry(run, &entry);
            applied.push(entry);
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Phase, PhaseStatus};
    use crate::run::{ExecutionMode, OUTPUT_TAG};

    #[test]
    fn test_structured_line() {
        let entry = parse_line("[2026-03-01 10:00:00] [CLONE] Cloning repository").unwrap();
        assert_eq!(entry.timestamp, "2026-03-01 10:00:00");
        assert_eq!(entry.phase_tag, "CLONE");
        assert_eq!(entry.message, "Cloning repository");
        assert_eq!(entry.phase(), Some(Phase::Clone));
    }

    #[test]
    fn test_unstructured_and_blank_lines() {
        let entry = parse_line("\x1b[33mwarning: something\x1b[0m").unwrap();
        assert_eq!(entry.phase_tag, OUTPUT_TAG);
        assert_eq!(entry.message, "warning: something");
        assert!(!entry.is_structured());
        assert!(parse_line("   ").is_none());
        assert!(parse_line("\x1b[0m").is_none());
    }

    #[test]
    fn test_colored_structured_line() {
        let entry = parse_line("\x1b[2m[10:00:00]\x1b[0m [review] LGTM").unwrap();
        assert_eq!(entry.phase_tag, "REVIEW");
        assert_eq!(entry.message, "LGTM");
    }

    #[test]
    fn test_chunked_stream_applies_in_order() {
        let mut run = Run::new("/repo".into(), "t", ExecutionMode::Foreground);
        let mut parser = LogStreamParser::new();
        let stream = "[t] [CLONE] Cloning\n[t] [CLONE] Completed in 1s\nagent chatter\n[t] [SETUP] No setup";
        let bytes = stream.as_bytes();
        let mut applied = Vec::new();
        for chunk in bytes.chunks(7) {
            applied.extend(parser.apply_bytes(&mut run, chunk));
        }
        assert_eq!(applied.len(), 3);
        assert_eq!(parser.pending(), "[t] [SETUP] No setup".len());
        applied.extend(parser.finish(&mut run));

        assert_eq!(applied.len(), 4);
        assert_eq!(run.logs.len(), 4);
        assert_eq!(run.logs[2].phase_tag, OUTPUT_TAG);
        assert_eq!(run.phases.get(Phase::Clone), PhaseStatus::Completed);
        assert_eq!(run.phases.get(Phase::Setup), PhaseStatus::Active);
    }
}
