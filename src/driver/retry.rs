//! Retry-with-backoff for network-sensitive commands.
//!
//! Failures are classified by matching the combined output against a fixed,
//! case-insensitive set of connectivity, DNS, TLS and HTTP 429/5xx
//! signatures. Anything else fails immediately.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use super::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::config::RetryConfig;
use crate::errors::DriverError;
use crate::util::first_line;

/// Hard ceiling on attempts, whatever the configuration says.
pub const MAX_ATTEMPTS: u32 = 3;

static TRANSIENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(",
        // connectivity
        r"econnreset|econnrefused|econnaborted|etimedout|ehostunreach|enetunreach|epipe",
        r"|connection (reset|refused|closed|timed out|aborted)|socket hang up",
        r"|operation timed out|timed out|network is unreachable|remote end hung up|early eof",
        // dns
        r"|enotfound|eai_again|could not resolve host|temporary failure in name resolution",
        r"|name or service not known|getaddrinfo",
        // tls
        r"|tls handshake|ssl_error|ssl connect error|gnutls_handshake|certificate verify failed",
        // http
        r"|\b429\b|too many requests|rate limit|\b50[0234]\b|internal server error|bad gateway",
        r"|service unavailable|gateway timeout|overloaded",
        r")"
    ))
    .unwrap()
});

/// Whether a failure's output looks transient (worth retrying).
pub fn is_transient(output: &str) -> bool {
    TRANSIENT_REGEX.is_match(output)
}

/// Bounded attempt count plus a per-retry delay list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to `1..=3`.
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS),
            delays,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config
                .delays_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0-based). The last configured
    /// delay is reused past the end of the list.
    pub fn delay_for(&self, retry: usize) -> Duration {
        self.delays
            .get(retry)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// What the caller is told before each retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub reason: String,
}

impl RetryNotice {
    pub fn message(&self) -> String {
        format!(
            "Transient failure (attempt {}/{}), retrying in {}s: {}",
            self.attempt,
            self.max_attempts,
            self.delay.as_secs(),
            self.reason
        )
    }
}

/// Run `spec`, retrying transient failures according to `policy`.
///
/// Returns the successful output, `CommandFailed` for a non-transient
/// failure, or `RetriesExhausted` once the budget is spent.
pub async fn run_with_retry(
    runner: &dyn CommandRunner,
    policy: &RetryPolicy,
    spec: &CommandSpec,
    on_retry: &mut (dyn FnMut(&RetryNotice) + Send),
) -> Result<CommandOutput, DriverError> {
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;
    loop {
        let output = runner.run(spec).await?;
        if output.success() {
            return Ok(output);
        }

        let combined = output.combined();
        if !is_transient(&combined) {
            return Err(DriverError::CommandFailed {
                command: spec.short_display(),
                exit_code: output.exit_code,
                output: combined,
            });
        }
        if attempt >= max_attempts {
            return Err(DriverError::RetriesExhausted {
                command: spec.short_display(),
                attempts: attempt,
                output: combined,
            });
        }

        let notice = RetryNotice {
            attempt,
            max_attempts,
            delay: policy.delay_for((attempt - 1) as usize),
            reason: first_line(&combined, 160),
        };
        tracing::warn!(command = %spec.short_display(), attempt, "{}", notice.message());
        on_retry(&notice);
        tokio::time::sleep(notice.delay).await;
        attempt += 1;
    }
}
