//! Bounded retry with backoff around fallible invocations.

use crate::error::EngineError;
use crate::step::StepName;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

/// Retry policy for step and capability invocations.
///
/// Defines how an invocation should be re-attempted when it fails
/// retryably. Supports no retry, fixed delay, and exponential backoff.
///
/// # Examples
///
/// ```
/// use kizami::RetryPolicy;
/// use std::time::Duration;
///
/// // No retry (default)
/// let policy = RetryPolicy::None;
///
/// // Fixed delay: retry 3 times with 1 second delay
/// let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
///
/// // Exponential backoff: retry 5 times starting at 100ms
/// let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// No retry - fail immediately on error.
    #[default]
    None,
    /// Fixed delay between retries.
    Fixed {
        /// Maximum number of retry attempts
        max_retries: u32,
        /// Delay between each retry
        delay: Duration,
    },
    /// Exponential backoff with configurable parameters.
    ExponentialBackoff {
        /// Maximum number of retry attempts
        max_retries: u32,
        /// Initial delay before first retry
        initial_delay: Duration,
        /// Maximum delay cap
        max_delay: Duration,
        /// Multiplier for each retry (e.g., 2 doubles the delay)
        multiplier: u32,
    },
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl std::fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

impl RetryPolicy {
    /// Creates a fixed retry policy.
    ///
    /// Retries the invocation up to `max_retries` times with a constant
    /// `delay` between each attempt.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy::Fixed { max_retries, delay }
    }

    /// Creates an exponential backoff retry policy with default settings.
    ///
    /// Uses `multiplier=2` and `max_delay=60s`. The delay doubles after
    /// each attempt until reaching the maximum.
    ///
    /// # Examples
    ///
    /// ```
    /// use kizami::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
    ///
    /// // Delays: 100ms, 200ms, 400ms, 800ms, 1600ms
    /// assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_millis(100)));
    /// assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(200)));
    /// assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(400)));
    /// ```
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    /// Creates an exponential backoff retry policy with custom settings.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] if:
    /// - `multiplier` is 0 (would result in no backoff)
    /// - `multiplier` is greater than 10 (risk of overflow)
    /// - `max_delay` is less than `initial_delay`
    pub fn exponential_backoff(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self, RetryPolicyError> {
        if multiplier == 0 {
            return Err(RetryPolicyError("multiplier must be greater than 0"));
        }
        if multiplier > 10 {
            return Err(RetryPolicyError(
                "multiplier must be 10 or less to avoid overflow",
            ));
        }
        if max_delay < initial_delay {
            return Err(RetryPolicyError("max_delay must be >= initial_delay"));
        }
        Ok(RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        })
    }

    /// Returns the maximum number of retries for this policy.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed { max_retries, .. } => *max_retries,
            RetryPolicy::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// Calculates the delay before the given retry attempt.
    ///
    /// Attempt numbers are 0-indexed (first retry is attempt 0). Returns
    /// `None` for `RetryPolicy::None`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed { delay, .. } => Some(*delay),
            RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let delay = initial_delay.as_millis() as u64 * (*multiplier as u64).pow(attempt);
                Some(Duration::from_millis(
                    delay.min(max_delay.as_millis() as u64),
                ))
            }
        }
    }
}

/// Runs `call` under `policy`, re-invoking on retryable failures.
///
/// Each attempt is bounded by `call_timeout` (if any); an elapsed timeout
/// counts as a retryable external-call failure. Fatal errors and exhausted
/// retries surface the last error unchanged. The returned count is the
/// total number of invocations made, so an exhausted policy reports
/// `policy.max_retries() + 1`.
///
/// Retry budgets are per invocation of this function; concurrent callers
/// never share a budget.
pub async fn invoke_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    call_timeout: Option<Duration>,
    step: &StepName,
    mut call: F,
) -> (Result<T, EngineError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let max_retries = policy.max_retries();
    let mut attempt: u32 = 0;

    loop {
        let outcome = match call_timeout {
            Some(limit) => match timeout(limit, call(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    step_name: step.clone(),
                }),
            },
            None => call(attempt).await,
        };

        match outcome {
            Ok(value) => return (Ok(value), attempt + 1),
            Err(error) => {
                if error.is_retryable() && attempt < max_retries {
                    info!(
                        step = %step,
                        attempt = attempt + 1,
                        max_retries,
                        error = %error,
                        "retrying after failure"
                    );
                    if let Some(delay) = policy.delay_for_attempt(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                    continue;
                }
                return (Err(error), attempt + 1);
            }
        }
    }
}
