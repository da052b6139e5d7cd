//! Bounded retry and backoff logic for Backhaul.
//!
//! Every retried step in Backhaul (account lookup, session token issuance,
//! index repair after a lock) runs under a [`RetryPolicy`]: a fixed number of
//! attempts with exponentially growing, jittered pauses between them. The
//! closure decides per failure whether another attempt makes sense by
//! returning [`backoff::Error::Transient`] or [`backoff::Error::Permanent`].

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors returned once a retried operation gives up
#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("Operation '{operation}' exceeded maximum retry attempts ({attempts}): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: E,
    },
    #[error("Permanent error in '{operation}' on attempt {attempt}: {source}")]
    Permanent {
        operation: &'static str,
        attempt: u32,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// The last error observed before giving up
    pub fn into_inner(self) -> E {
        match self {
            RetryError::MaxRetriesExceeded { source, .. } => source,
            RetryError::Permanent { source, .. } => source,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            RetryError::MaxRetriesExceeded { operation, .. } => operation,
            RetryError::Permanent { operation, .. } => operation,
        }
    }

    /// Number of attempts made, including the failing one
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::MaxRetriesExceeded { attempts, .. } => *attempts,
            RetryError::Permanent { attempt, .. } => *attempt,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<T, RetryError<E>>;

/// Exponential backoff with a hard cap on the number of attempts.
///
/// `max_steps` counts attempts, so a policy with five steps runs the
/// operation at most five times and sleeps at most four times.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_steps: u32,
}

impl RetryPolicy {
    pub const fn new(initial_delay: Duration, multiplier: f64, jitter: f64, max_steps: u32) -> Self {
        Self {
            initial_delay,
            multiplier,
            jitter,
            max_steps,
        }
    }

    /// Policy for resolving an identity to its account email
    pub const fn account_lookup() -> Self {
        Self::new(Duration::from_secs(2), 2.0, 0.1, 5)
    }

    /// Policy for exchanging a user token for backend credentials
    pub const fn token_issuance() -> Self {
        Self::new(Duration::from_secs(3), 2.0, 0.1, 3)
    }

    /// Policy for `repair index`, including unlock-and-retry on a held lock
    pub const fn repair_index() -> Self {
        Self::new(Duration::from_secs(2), 2.0, 0.1, 10)
    }

    /// Replace the attempt cap
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Replace the first pause
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    fn delays(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.jitter)
            .with_max_interval(Duration::from_secs(60 * 60))
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::account_lookup()
    }
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Wrap an error for the retry loop according to its own classification
pub fn classify<E: RetryableError>(err: E) -> backoff::Error<E> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

/// Run `f` until it succeeds, fails permanently, or the policy runs out of steps.
///
/// The closure receives the 1-based attempt number. When every attempt fails,
/// the last observed error is returned inside [`RetryError::MaxRetriesExceeded`].
pub async fn retry_on_error<T, E, F, Fut>(
    operation: &'static str,
    policy: &RetryPolicy,
    mut f: F,
) -> RetryResult<T, E>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, backoff::Error<E>>>,
{
    let max_steps = policy.max_steps.max(1);
    let mut delays = policy.delays();
    let mut attempt = 1;

    loop {
        debug!(operation, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retrying");
                }
                return Ok(result);
            }
            Err(backoff::Error::Permanent(err)) => {
                warn!(operation, attempt, error = %err, "Operation failed permanently");
                return Err(RetryError::Permanent {
                    operation,
                    attempt,
                    source: err,
                });
            }
            Err(backoff::Error::Transient { err, retry_after }) => {
                if attempt >= max_steps {
                    warn!(operation, attempt, error = %err, "Operation out of retry attempts");
                    return Err(RetryError::MaxRetriesExceeded {
                        operation,
                        attempts: attempt,
                        source: err,
                    });
                }

                let delay = retry_after
                    .or_else(|| delays.next_backoff())
                    .unwrap_or(policy.initial_delay);
                warn!(
                    operation,
                    attempt,
                    max_attempts = max_steps,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
