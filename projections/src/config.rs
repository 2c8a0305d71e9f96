//! Subscription configuration.
//!
//! Values are provided by the application; the defaults suit tests and small
//! deployments.

use std::time::Duration;

/// Tuning of a read model's subscription loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Catch up at least this often, even without a notification.
    ///
    /// Default: 5 seconds
    pub poll_interval: Duration,

    /// First delay after a failed catch-up; doubled on each consecutive failure.
    ///
    /// Default: 100 milliseconds
    pub retry_base_delay: Duration,

    /// Upper bound of the retry delay.
    ///
    /// Default: 30 seconds
    pub retry_max_delay: Duration,

    /// Maximum events per catch-up query. A full batch is followed by another
    /// query right away.
    ///
    /// Default: 200
    pub batch_size: u32,

    /// Ask the backend to wait for still-open writing transactions.
    ///
    /// Default: true
    pub await_open_transactions: bool,
}

impl SubscriptionConfig {
    /// Create the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(30),
            batch_size: 200,
            await_open_transactions: true,
        }
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the retry delays.
    #[must_use]
    pub const fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    /// Set the catch-up batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enable or disable waiting for open transactions.
    #[must_use]
    pub const fn with_await_open_transactions(mut self, enabled: bool) -> Self {
        self.await_open_transactions = enabled;
        self
    }

    /// Delay before retry number `attempt` (starting at 1).
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self::new()
    }
}
