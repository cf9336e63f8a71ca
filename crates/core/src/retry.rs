//! Retry policy for transient card failures
//!
//! The policy is a pure function of (failure kind, attempt count); the
//! mutable attempt counter lives on the card object and is reset on the
//! first success.

use std::time::Duration;

use crate::error::FailureKind;

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after waiting this long
    Retry(Duration),
    /// Report the failure to the caller
    GiveUp,
}

/// Decides whether a failed operation is worth repeating
///
/// A platform reset is always transient and always retried; a removed or
/// absent card never is. Everything else (sharing violations, generic
/// provider failures) is retried a bounded number of times. The delay
/// doubles with each attempt up to a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts granted to bounded-retry failures
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling for the doubling delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Policy used by the connection-acquisition monitor: slower seed,
    /// same doubling and ceiling, tuned for reacting to a card that was
    /// inserted moments ago and is still settling.
    pub const fn acquisition() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(20),
        }
    }

    /// Decide whether attempt number `attempt` (zero-based) should be
    /// followed by another try
    pub fn decide(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        match kind {
            FailureKind::Reset => RetryDecision::Retry(self.delay(attempt)),
            FailureKind::Unavailable | FailureKind::InvalidState => RetryDecision::GiveUp,
            FailureKind::Sharing | FailureKind::Transport => {
                if attempt < self.max_retries {
                    RetryDecision::Retry(self.delay(attempt))
                } else {
                    RetryDecision::GiveUp
                }
            }
        }
    }

    /// Backoff delay for a zero-based attempt number
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
