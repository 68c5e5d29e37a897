//! Retry policy arithmetic for action nodes.
//!
//! Stateless: all logic is in associated functions that take the node's
//! [`RetryPolicy`] as a parameter.

use std::time::Duration;

use runloom_types::dag::{Backoff, RetryPolicy};

pub struct RetryHandler;

impl RetryHandler {
    /// Total provider calls allowed: the first attempt plus `retries`.
    pub fn max_attempts(policy: &RetryPolicy) -> u32 {
        policy.retries.saturating_add(1)
    }

    /// Whether another attempt follows a failed `attempt` (1-based).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < Self::max_attempts(policy)
    }

    /// Wait before retry `retry` (1-based).
    ///
    /// - linear: `delay_ms * retry`
    /// - exponential: `delay_ms * 2^(retry - 1)`
    pub fn delay(policy: &RetryPolicy, retry: u32) -> Duration {
        let retry = retry.max(1);
        let ms = match policy.backoff {
            Backoff::Linear => policy.delay_ms.saturating_mul(u64::from(retry)),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
                policy.delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms)
    }

    /// Final error message once every attempt has failed.
    pub fn exhausted_message(last_error: &str) -> String {
        format!("Retries exhausted: {last_error}")
    }
}
