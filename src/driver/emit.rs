//! Structured wire output: `[YYYY-MM-DD HH:MM:SS] [PHASE] message`.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::phase::Phase;
use crate::run::{DONE_TAG, now_timestamp};

/// Writes structured lines to the Driver's stdout (or a capture in tests).
#[derive(Clone)]
pub struct Emitter {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Emitter {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    /// Emit one line under `tag`. Embedded newlines are flattened so one
    /// event is always exactly one line.
    pub fn line(&self, tag: &str, message: &str) {
        let message = message
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" | ");
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        // A closed stdout leaves nothing useful to do with the error.
        let _ = writeln!(out, "[{}] [{}] {}", now_timestamp(), tag, message);
        let _ = out.flush();
    }

    pub fn phase(&self, phase: Phase, message: &str) {
        self.line(phase.tag(), message);
    }

    pub fn done(&self, total_secs: u64) {
        self.line(DONE_TAG, &format!("Total duration: {}s", total_secs));
    }
}

/// In-memory `Write` target shared between an [`Emitter`] and a test.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub(crate) fn emitter(&self) -> Emitter {
        Emitter::new(Box::new(self.clone()))
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
