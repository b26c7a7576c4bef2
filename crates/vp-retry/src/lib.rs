// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policies with exponential backoff and jitter.
//!
//! The context loader retries transient artifact fetches under
//! [`RetryPolicy::loader_default`] (base 100 ms, cap 2 s, 3 attempts).
//! Non-retryable errors short-circuit immediately, and the runner observes
//! the ambient [`CancelToken`] between attempts and while sleeping.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::sleep;
use tracing::debug;
use vp_core::CancelToken;
use vp_error::{RetryStrategy, VerifyError, VerifyResult};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential-backoff retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1]`; each delay is scaled by a factor drawn
    /// from `[1 - jitter, 1 + jitter)`.
    pub jitter: f64,
}

impl RetryPolicy {
    /// The context-loader policy: base 100 ms, cap 2 s, 3 attempts.
    #[must_use]
    pub fn loader_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: 0.25,
        }
    }

    /// Start building a policy from the loader default.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::loader_default(),
        }
    }

    /// The un-jittered delay before retry number `retry` (1-based):
    /// `base * 2^(retry - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        scaled.min(self.max_delay)
    }

    /// The jittered delay before retry number `retry`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + self.jitter * (2.0 * jitter_unit() - 1.0);
        let jittered = base.mul_f64(factor.max(0.0));
        jittered.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::loader_default()
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set the maximum number of attempts (including the first).
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the jitter fraction (clamped to `[0, 1]`).
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.policy.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Finish the builder.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// A uniform value in `[0, 1)` from a SystemTime-seeded xorshift. The spec
/// constrains the delay bounds, not the draw, so a seeded PRNG keeps the
/// crate free of a randomness dependency the rest of the workspace never
/// needs.
fn jitter_unit() -> f64 {
    let mut state = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E37_79B9_7F4A_7C15)
        | 1;
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    (state >> 11) as f64 / (1u64 << 53) as f64
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run `operation` under `policy`, retrying transient failures.
///
/// Non-retryable errors (per [`VerifyError::retryable`]) short-circuit
/// without further attempts. Cancellation is checked before every attempt
/// and interrupts backoff sleeps. The final error gains an `attempts`
/// detail.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    operation: &str,
    mut f: F,
) -> VerifyResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VerifyResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(VerifyError::cancelled(operation));
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.retryable || attempt >= policy.max_attempts => {
                return Err(err.with_detail("attempts", attempt));
            }
            Err(err) => {
                let delay = match err.retry_strategy {
                    RetryStrategy::Immediate => Duration::ZERO,
                    _ => policy.delay_for(attempt),
                };
                debug!(
                    target: "vp.retry",
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    code = %err.code,
                    "retrying after transient failure"
                );
                tokio::select! {
                    () = sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return Err(VerifyError::cancelled(operation));
                    }
                }
                attempt += 1;
            }
        }
    }
}
