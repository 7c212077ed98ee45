//! Bounded retries with fixed backoff.
//!
//! Every connect, characteristic enumeration and read goes through a
//! [`RetryPolicy`]. Failures whose [`ErrorKind`] is listed in the budget's
//! `fatal_on` set end the operation at once; everything else is retried after
//! a fixed sleep until the budget runs out.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Operation};

/// Retry configuration for one kind of operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryBudget {
    /// Stop after this many failed tries. Zero disables the operation.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
    /// Error kinds that abort immediately without consuming budget.
    pub fatal_on: BTreeSet<ErrorKind>,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            fatal_on: BTreeSet::from([ErrorKind::Disconnect]),
        }
    }
}

impl RetryBudget {
    /// Budget of `max_attempts` tries, `backoff` apart, fatal on disconnects.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            ..Self::default()
        }
    }

    /// A budget that never runs the operation.
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Replace the set of fatal error kinds.
    pub fn with_fatal_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.fatal_on = kinds.into_iter().collect();
        self
    }

    /// Retry every failure, including disconnects.
    pub fn retry_all(self) -> Self {
        self.with_fatal_on([])
    }

    /// Set the delay between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check if the operation may run at all.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Check if `error` aborts the operation immediately.
    pub fn is_fatal(&self, error: &Error) -> bool {
        self.fatal_on.contains(&error.kind())
    }
}

/// Why a retried operation failed.
#[derive(Debug)]
pub enum RetryError {
    /// Every attempt failed with a retryable error.
    Exhausted {
        /// The retried step.
        operation: Operation,
        /// Number of attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: Error,
    },
    /// An attempt failed with a fatal error.
    Fatal {
        /// The retried step.
        operation: Operation,
        /// Attempt that hit the error, starting at 1.
        attempt: u32,
        /// The fatal error.
        error: Error,
    },
}

impl RetryError {
    /// Check if the failure was fatal rather than exhausted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::Fatal { attempt, .. } => *attempt,
        }
    }
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted {
                operation,
                attempts,
                last_error,
            } => write!(
                f,
                "{}: failed after {} attempts: {}",
                operation, attempts, last_error
            ),
            Self::Fatal {
                operation,
                attempt,
                error,
            } => write!(f, "{}: fatal on attempt {}: {}", operation, attempt, error),
        }
    }
}

impl std::error::Error for RetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Fatal { error, .. } => Some(error),
        }
    }
}

impl From<RetryError> for Error {
    /// Fatal errors pass through unchanged so callers still see the disconnect.
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Exhausted {
                operation,
                attempts,
                last_error,
            } => Error::RetryExhausted {
                operation,
                attempts,
                last_error: Box::new(last_error),
            },
            RetryError::Fatal { error, .. } => error,
        }
    }
}

/// Runs an operation under a [`RetryBudget`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    operation: Operation,
    budget: RetryBudget,
}

impl RetryPolicy {
    /// Create a policy for `operation`.
    pub fn new(operation: Operation, budget: RetryBudget) -> Self {
        Self { operation, budget }
    }

    /// The budget in use.
    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is used up.
    ///
    /// `op` receives the attempt number, starting at 1. The policy sleeps
    /// `backoff` after each retryable failure except the last.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let max_attempts = self.budget.max_attempts;
        if max_attempts == 0 {
            return Err(RetryError::Exhausted {
                operation: self.operation,
                attempts: 0,
                last_error: Error::InvalidParameter {
                    name: "max_attempts".to_string(),
                    value: "0".to_string(),
                },
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            match op(attempt).await {
                Ok(value) => {
                    debug!("{}: OK .. {}/{}", self.operation, attempt, max_attempts);
                    return Ok(value);
                }
                Err(error) if self.budget.is_fatal(&error) => {
                    warn!("{}: fatal .. {}/{}: {}", self.operation, attempt, max_attempts, error);
                    return Err(RetryError::Fatal {
                        operation: self.operation,
                        attempt,
                        error,
                    });
                }
                Err(error) => {
                    warn!("{}: NG .. {}/{}: {}", self.operation, attempt, max_attempts, error);

                    if attempt >= max_attempts {
                        return Err(RetryError::Exhausted {
                            operation: self.operation,
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    tokio::time::sleep(self.budget.backoff).await;
                }
            }
        }
    }
}

/// Run `op` under `budget`. Shorthand for [`RetryPolicy::execute`].
pub async fn execute<T, F, Fut>(
    operation: Operation,
    budget: &RetryBudget,
    op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    RetryPolicy::new(operation, budget.clone()).execute(op).await
}
