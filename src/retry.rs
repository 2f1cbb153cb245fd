//! Reconnect delay and timeout utilities.
//!
//! Push channels reconnect after a fixed delay rather than an exponential
//! backoff, and never retry immediately.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Policy controlling the delay between push-channel reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay between a lost connection and the next attempt.
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// Delay used when none is configured.
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(3000);

    /// Returns a policy that waits `delay` before every reconnect.
    ///
    /// A zero delay is raised to one millisecond so a failing endpoint can
    /// never be retried in a tight loop.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay: delay.max(Duration::from_millis(1)),
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based. The delay does not grow with the attempt count.
    pub fn delay_for_attempt(&self, attempt: u64) -> Duration {
        debug!(
            event = "reconnect_delay",
            attempt,
            delay_ms = self.delay.as_millis() as u64
        );
        self.delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Self::DEFAULT_DELAY)
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
