//! Shared attempt budget, backoff and error classification.
//!
//! Every remote call that may be retried goes through [`RetryPolicy`] so that a
//! terminal rejection (wrong password, unknown book) is surfaced on the first
//! attempt instead of burning the budget.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use crate::api::{ApiError, ApiResult};
use crate::config::schema::RetrySettings;

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every attempt.
    Fixed,
    /// Delay doubles after each attempt, capped at `max`.
    Exponential { max: Duration },
}

/// The outcome of an operation that did not succeed within its policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("{label} rejected after {attempts} attempt(s): {source}")]
    Rejected {
        label: String,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("{label} gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        label: String,
        attempts: u32,
        last: ApiError,
    },
}

impl RetryError {
    /// The last error returned by the operation.
    pub fn api_error(&self) -> &ApiError {
        match self {
            RetryError::Rejected { source, .. } => source,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Rejected { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// True if the operation failed because the KDP session is gone.
    pub fn is_auth_error(&self) -> bool {
        self.api_error().is_auth_error()
    }
}

/// Interval, attempt budget and backoff shared by probes, workers and syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed-interval policy.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed,
        }
    }

    /// Exponential policy starting at `interval`, capped at `max`.
    pub fn exponential(interval: Duration, max_attempts: u32, max: Duration) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { max },
        }
    }

    /// Builds a policy from configuration.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        let interval = Duration::from_millis(settings.interval_ms);
        match settings.max_interval_ms {
            Some(max_ms) => {
                Self::exponential(interval, settings.max_attempts, Duration::from_millis(max_ms))
            }
            None => Self::fixed(interval, settings.max_attempts),
        }
    }

    /// Classifies an error. Identical for every caller.
    pub fn classify(error: &ApiError) -> ErrorClass {
        if error.is_retryable() {
            ErrorClass::Retryable
        } else {
            ErrorClass::Terminal
        }
    }

    /// Delay to wait after `attempt` (1-based) failed, before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max } => {
                let shift = attempt.saturating_sub(1).min(16);
                self.interval.saturating_mul(1u32 << shift).min(max)
            }
        }
    }

    /// Runs `op` until it succeeds, fails terminally or the budget is spent.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        self.run_with_notify(label, op, |_, _| {}).await
    }

    /// Like [`run`](Self::run), calling `on_retry(attempt, error)` before each
    /// wait so callers can surface retries in their own logs.
    pub async fn run_with_notify<T, F, Fut, N>(
        &self,
        label: &str,
        mut op: F,
        mut on_retry: N,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ApiResult<T>>,
        N: FnMut(u32, &ApiError),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if Self::classify(&error) == ErrorClass::Terminal {
                        return Err(RetryError::Rejected {
                            label: label.to_string(),
                            attempts: attempt,
                            source: error,
                        });
                    }

                    if attempt >= max_attempts {
                        warn!(
                            "{} failed after {} attempt(s): {}",
                            label, attempt, error
                        );
                        return Err(RetryError::Exhausted {
                            label: label.to_string(),
                            attempts: attempt,
                            last: error,
                        });
                    }

                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} failed with retryable error (attempt {}/{}), retrying in {:?}: {}",
                        label, attempt, max_attempts, delay, error
                    );
                    on_retry(attempt, &error);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// 2s, 4s, 8s between three attempts.
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2), 3, Duration::from_secs(8))
    }
}
