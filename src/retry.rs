//! Retry executor with bounded exponential backoff.
//!
//! Wraps any async provider operation. Retryability is decided by the
//! error's HTTP-like status code against the policy's retryable set;
//! transport errors without a status are treated as transient, everything
//! else (configuration, validation) is terminal. A run makes at most
//! `max_retries + 1` attempts.
//!
//! The wait before attempt `n + 1` is
//! `min(base * 2^n + uniform_jitter(0, base), max_delay)`, lengthened to a
//! backend-supplied `Retry-After` hint when one is present.
//!
//! # Usage
//!
//! ```ignore
//! use trendscope_ai::retry::{RetryExecutor, RetryPolicy};
//!
//! let executor = RetryExecutor::new();
//! let generation = executor
//!     .execute(&RetryPolicy::default(), || async {
//!         provider.generate(&request).await
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{AiError, Result};

/// Status codes retried by default: rate limiting and transient server
/// failures.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Largest exponent applied to the base delay. Beyond this the cap always
/// wins, so shifting further would only risk overflow.
const MAX_BACKOFF_SHIFT: u32 = 20;

// ============================================================================
// Retry Policy
// ============================================================================

/// Backoff configuration for a retry run.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,

    /// Base delay; also the jitter range.
    pub base_delay: Duration,

    /// Upper bound on the computed backoff delay. A `Retry-After` hint may
    /// exceed it.
    pub max_delay: Duration,

    /// Provider status codes worth retrying.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Build a policy with the default retryable status set.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }

    /// Replace the retryable status set.
    pub fn with_retryable_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.retryable_statuses = statuses;
        self
    }

    /// Whether a failed attempt should be retried.
    ///
    /// A status in the retryable set retries; a status outside it is
    /// terminal. Errors without a status retry only when they are
    /// transport-level. Domain errors (config, validation, missing data)
    /// never retry.
    pub fn should_retry(&self, error: &AiError) -> bool {
        match error.status() {
            Some(status) => self.retryable_statuses.contains(&status),
            None => error.is_transport(),
        }
    }

    /// Backoff before the attempt following failed attempt `attempt`
    /// (0-based): `min(base * 2^attempt + jitter, max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exponential = self.unjittered_ms(attempt);
        let jitter = if base_ms > 0 {
            rand::thread_rng().gen_range(0..base_ms)
        } else {
            0
        };
        Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
    }

    /// Full wait for a failed attempt, honoring a `Retry-After` hint: the
    /// larger of the computed backoff and the hint.
    pub fn delay_for(&self, error: &AiError, attempt: u32) -> Duration {
        let computed = self.backoff_delay(attempt);
        match error.retry_after() {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }

    fn unjittered_ms(&self, attempt: u32) -> u64 {
        let base_ms = self.base_delay.as_millis() as u64;
        base_ms.saturating_mul(1u64 << attempt.min(MAX_BACKOFF_SHIFT))
    }
}

// ============================================================================
// Retry Notice (observer payload)
// ============================================================================

/// Passed to the retry observer before each backoff sleep. Informational
/// only; observers cannot alter control flow.
#[derive(Debug)]
pub struct RetryNotice<'a> {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,

    /// The failure that triggered the retry.
    pub error: &'a AiError,

    /// How long the executor will wait before the next attempt.
    pub delay: Duration,
}

// ============================================================================
// Retry Executor
// ============================================================================

/// Executes operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    log_retries: bool,
}

impl RetryExecutor {
    /// Executor that logs each retry at `warn`.
    pub fn new() -> Self {
        Self { log_retries: true }
    }

    /// Executor that retries without logging. Useful in tests and when the
    /// caller installs its own observer.
    pub fn silent() -> Self {
        Self { log_retries: false }
    }

    /// Run `operation` under `policy`.
    pub async fn execute<T, F, Fut>(&self, policy: &RetryPolicy, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_observed(policy, operation, |_: &RetryNotice| {})
            .await
    }

    /// Run `operation` under `policy`, invoking `on_retry` before each
    /// backoff sleep.
    pub async fn execute_observed<T, F, Fut, O>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
        mut on_retry: O,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        O: FnMut(&RetryNotice<'_>),
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !policy.should_retry(&error) || attempt >= policy.max_retries {
                        return Err(error);
                    }

                    let delay = policy.delay_for(&error, attempt);
                    if self.log_retries {
                        warn!(
                            attempt = attempt + 1,
                            max_retries = policy.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "generation attempt failed, retrying"
                        );
                    }
                    on_retry(&RetryNotice {
                        attempt: attempt + 1,
                        error: &error,
                        delay,
                    });

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
