//! Reconnect attempts with exponential backoff.

use std::time::Duration;

/// How the health sweep retries a tunnel that dropped out of the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Total connect attempts per sweep, the first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each retry
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.clone())
    }
}

/// Delays between the attempts allowed by a [`ReconnectPolicy`].
pub struct ExponentialBackoff {
    policy: ReconnectPolicy,
    current_delay: Duration,
    retries: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            current_delay: policy.initial_delay,
            retries: 0,
            policy,
        }
    }

    /// Delay before the next retry, or None once every attempt is used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        // The first attempt is not a retry.
        if self.retries + 1 >= self.policy.max_attempts {
            return None;
        }

        let delay = self.current_delay;
        self.retries += 1;

        // Out of range products (negative, NaN, overflow) land on the cap.
        let next =
            Duration::try_from_secs_f64(self.current_delay.as_secs_f64() * self.policy.multiplier)
                .unwrap_or(self.policy.max_delay);
        self.current_delay = next.min(self.policy.max_delay);

        Some(delay)
    }

    /// 1-based number of the attempt that follows the last `next_delay`.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}
