//! # Reconnect Policies
//!
//! Pluggable delay schedules for the connection supervisor. A policy only
//! answers "how long until attempt N, or give up?"; it never touches the
//! network, so it can be tested in isolation.
//!
//! ## Predefined Policies
//!
//! | Policy | Attempts | Use |
//! |--------|----------|-----|
//! | [`FixedDelay::forever`] | unlimited | retry loop before a session exists (1 s) |
//! | [`ScheduledDelays::default`] | 4 | automatic reconnect after a drop: 0 s, 2 s, 10 s, 30 s |
//! | [`ExponentialBackoff`] | configurable | doubling delay with a cap |
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use hubwire::retry::{ExponentialBackoff, ReconnectPolicy};
//!
//! let policy = ExponentialBackoff::new(Duration::from_millis(250), Duration::from_secs(2));
//! assert_eq!(policy.next_delay(0), Some(Duration::from_millis(250)));
//! assert_eq!(policy.next_delay(1), Some(Duration::from_millis(500)));
//! assert_eq!(policy.next_delay(10), Some(Duration::from_secs(2)));
//! ```

use std::fmt::Debug;
use std::time::Duration;

/// Decides the delay before each retry attempt.
pub trait ReconnectPolicy: Debug + Send + Sync {
    /// Delay before retry number `attempt` (zero-based), or `None` to give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Same delay every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedDelay {
    /// Retry indefinitely, waiting `delay` between attempts.
    #[must_use]
    pub fn forever(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Retry at most `max_attempts` times.
    #[must_use]
    pub fn limited(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }
}

impl ReconnectPolicy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt >= max => None,
            _ => Some(self.delay),
        }
    }
}

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Maximum number of retries; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.checked_mul(factor).unwrap_or(self.max_delay);
        Some(std::cmp::min(delay, self.max_delay))
    }
}

/// Explicit list of delays, one attempt per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledDelays {
    delays: Vec<Duration>,
}

impl ScheduledDelays {
    #[must_use]
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }
}

impl Default for ScheduledDelays {
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ])
    }
}

impl ReconnectPolicy for ScheduledDelays {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        usize::try_from(attempt)
            .ok()
            .and_then(|index| self.delays.get(index).copied())
    }
}
