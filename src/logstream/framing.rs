//! Byte stream → complete lines.

use regex::Regex;
use std::sync::LazyLock;

static ANSI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)", // OSC
        r"|\x1b\[[0-?]*[ -/]*[@-~]",          // CSI
        r"|\x1b[@-Z\\-_]",                    // two-byte
    ))
    .unwrap()
});

/// Remove terminal escape sequences and stray control characters.
pub fn strip_ansi(line: &str) -> String {
    ANSI_REGEX
        .replace_all(line, "")
        .chars()
        .filter(|c| *c == '\t' || !c.is_control())
        .collect()
}

/// Buffers incoming bytes and yields complete lines, carrying any trailing
/// partial line into the next chunk. `\r\n` is normalized to `\n`.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete[..last_newline]
            .split(|b| *b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    /// Flush the carried partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.partial);
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest[..]);
        Some(String::from_utf8_lossy(rest).into_owned())
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_line_is_carried() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"[t] [CLONE] Clo"), Vec::<String>::new());
        assert_eq!(framer.pending(), 15);
        assert_eq!(
            framer.push(b"ning\r\nnext\npart"),
            vec!["[t] [CLONE] Cloning".to_string(), "next".to_string()]
        );
        assert_eq!(framer.finish(), Some("part".to_string()));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let mut framer = LineFramer::new();
        let bytes = "héllo\n".as_bytes();
        assert!(framer.push(&bytes[..2]).is_empty());
        assert_eq!(framer.push(&bytes[2..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_empty_lines_are_kept_for_the_parser_to_drop() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"a\n\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[0m"), "ok");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi("\x1b]8;;http://x\x1b\\link"), "link");
        assert_eq!(strip_ansi("a\x1bMb"), "ab");
        assert_eq!(strip_ansi("plain\ttext"), "plain\ttext");
    }
}
