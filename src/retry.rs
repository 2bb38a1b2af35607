//! Reconnect and timeout utilities.
//!
//! The stream reader retries forever with a fixed delay. The policy here only
//! decides how long to wait before the next attempt; it never gives up.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling the pause between connection attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay applied before every reconnect attempt.
    pub delay: Duration,
    /// Maximum random jitter added to each delay. Zero disables jitter.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Fixed delay without jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    /// Adds up to `jitter` of random spread to every delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based. The base delay does not grow with the attempt
    /// number; the attempt only seeds the jitter.
    pub fn delay_for_attempt(&self, attempt: u64) -> Duration {
        self.delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

/// Sleeps for the policy delay of `attempt`.
pub async fn backoff(policy: &ReconnectPolicy, attempt: u64) {
    let delay = policy.delay_for_attempt(attempt);
    debug!(
        event = "reconnect_backoff",
        attempt,
        delay_ms = delay.as_millis() as u64
    );
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
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

fn jitter_duration(max_jitter: Duration, attempt: u64) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ attempt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
