//! Transport restart policy
//!
//! A failed transport gets exactly one delayed automatic restart. If the
//! restarted transport fails again before it ever connects, the failure is
//! surfaced instead of retried.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

/// Restart policy configuration
///
/// Injectable so tests can shorten the delay.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay before the restart attempt
    pub delay: Duration,
    /// Automatic restarts allowed per failure episode (default: 1)
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(2000),
            max_attempts: 1,
        }
    }
}

impl RestartPolicy {
    /// Policy with a custom delay and the single-attempt limit
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Check if another restart is allowed
    pub fn should_restart(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Decision after a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Restart after the policy delay; carries the attempt number (1-based)
    Restart(u32),
    /// Give up and surface the failure
    Surface,
}

/// Per-session restart bookkeeping
#[derive(Debug, Default)]
pub struct RestartTracker {
    attempts: AtomicU32,
}

impl RestartTracker {
    /// Create a fresh tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and decide what to do
    pub fn on_failure(&self, policy: &RestartPolicy) -> FailureDecision {
        let attempts = self.attempts.load(Ordering::SeqCst);
        if policy.should_restart(attempts) {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            FailureDecision::Restart(attempt)
        } else {
            FailureDecision::Surface
        }
    }

    /// A transport reached the connected state, ending the failure episode
    pub fn on_connected(&self) {
        let previous = self.attempts.swap(0, Ordering::SeqCst);
        if previous > 0 {
            debug!("Transport recovered after {} restart(s)", previous);
        }
    }

    /// Restarts in the current episode
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}
