//! Scripted [`CommandRunner`] for unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use super::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::errors::DriverError;

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

struct Rule {
    key: String,
    responses: Vec<CommandOutput>,
    served: usize,
}

/// Answers commands from first-matching rules. A rule matches when its key
/// equals the command label or prefixes the display form. A rule's responses
/// are served in order and the last one repeats. Unmatched commands succeed
/// with empty output.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(&self, key: &str, response: CommandOutput) {
        self.on_seq(key, vec![response]);
    }

    pub(crate) fn on_seq(&self, key: &str, responses: Vec<CommandOutput>) {
        self.rules.lock().unwrap().push(Rule {
            key: key.to_string(),
            responses,
            served: 0,
        });
    }

    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls matching `key`.
    pub(crate) fn count(&self, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| matches(key, spec))
            .count()
    }

    /// Recorded calls matching `key`, oldest first.
    pub(crate) fn matching(&self, key: &str) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| matches(key, spec))
            .cloned()
            .collect()
    }
}

fn matches(key: &str, spec: &CommandSpec) -> bool {
    spec.label.as_deref() == Some(key) || spec.display().starts_with(key)
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DriverError> {
        self.calls.lock().unwrap().push(spec.clone());
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| matches(&r.key, spec)) else {
            return Ok(ok(""));
        };
        let index = rule.served.min(rule.responses.len().saturating_sub(1));
        rule.served += 1;
        Ok(rule.responses.get(index).cloned().unwrap_or_else(|| ok("")))
    }
}
