//! Reconnect backoff for the terminal connection

use std::time::{Duration, SystemTime};

use crate::config::TerminalConfig;

/// Reconnect policy
///
/// Delays grow exponentially from `base_delay` up to `max_delay` and carry
/// 0-25% jitter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Consecutive failures before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn from_config(config: &TerminalConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    #[must_use]
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures < max)
    }

    /// Delay before retry number `attempt` (0-based)
    ///
    /// `min(base_delay * 2^attempt + jitter, max_delay)`; jitter is derived
    /// from the system clock's subsecond nanos.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);

        let jitter_nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();

        // Scale to 0-25% of the base delay
        let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
        let jitter = base.mul_f64(jitter_fraction);

        (base + jitter).min(self.max_delay)
    }
}
