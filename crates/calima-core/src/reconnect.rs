//! Reconnection policy and backoff state.
//!
//! [`Backoff`] is the retry schedule the
//! [`ConnectionManager`](crate::ConnectionManager) walks through between
//! connection attempts: the first attempt is immediate, the first retry
//! waits [`ReconnectPolicy::first_retry_delay`], and every later retry waits
//! [`ReconnectPolicy::retry_delay`]. A successful connection resets it.

use std::time::Duration;

use crate::error::{Error, Result};

/// Options for connecting and reconnecting to one fan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub first_retry_delay: Duration,
    /// Delay before every later retry.
    pub retry_delay: Duration,
    /// Attempts per acquisition (None = until success or cancellation).
    pub max_attempts: Option<u32>,
    /// Bound on a single connect call.
    pub connect_timeout: Duration,
    /// How long a discovered advertisement is reused before rediscovering.
    pub advertisement_ttl: Duration,
    /// Reconnect in the background after an unsolicited disconnect.
    pub auto_reconnect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            first_retry_delay: Duration::from_secs(10),
            retry_delay: Duration::from_secs(30),
            max_attempts: Some(3),
            connect_timeout: Duration::from_secs(15),
            advertisement_ttl: Duration::from_secs(300),
            auto_reconnect: true,
        }
    }
}

impl ReconnectPolicy {
    /// Create a new policy with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy that keeps retrying until cancelled.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub fn first_retry_delay(mut self, delay: Duration) -> Self {
        self.first_retry_delay = delay;
        self
    }

    /// Set the delay before later retries.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the number of attempts per acquisition.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long advertisements are reused.
    #[must_use]
    pub fn advertisement_ttl(mut self, ttl: Duration) -> Self {
        self.advertisement_ttl = ttl;
        self
    }

    /// Enable or disable background reconnection.
    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Validate the policy.
    ///
    /// Checks that:
    /// - `max_attempts`, when set, is at least 1
    /// - `connect_timeout` is > 0
    /// - `retry_delay` >= `first_retry_delay`
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == Some(0) {
            return Err(Error::invalid_config("max_attempts must be at least 1"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be > 0"));
        }
        if self.retry_delay < self.first_retry_delay {
            return Err(Error::invalid_config("retry_delay must be >= first_retry_delay"));
        }
        Ok(())
    }
}

/// Position in the retry schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    first_retry_delay: Duration,
    retry_delay: Duration,
    attempt: u32,
}

impl Backoff {
    /// Start a schedule at attempt 0.
    pub fn new(first_retry_delay: Duration, retry_delay: Duration) -> Self {
        Self {
            first_retry_delay,
            retry_delay,
            attempt: 0,
        }
    }

    /// Start a schedule using the delays of `policy`.
    pub fn from_policy(policy: &ReconnectPolicy) -> Self {
        Self::new(policy.first_retry_delay, policy.retry_delay)
    }

    /// Number of attempts taken since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay the next attempt will wait, without advancing.
    pub fn peek_delay(&self) -> Duration {
        match self.attempt {
            0 => Duration::ZERO,
            1 => self.first_retry_delay,
            _ => self.retry_delay,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to attempt 0 after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
