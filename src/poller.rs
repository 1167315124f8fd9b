//! Generic wait-until-terminal loop for long-running cloud operations.
//!
//! Every adapter step the provider runs asynchronously (stop, snapshot,
//! export, image import, instance launch) goes through [`await_completion`].
//! The status check is supplied by the caller, so the loop knows nothing
//! about any particular vendor. Single provider calls that fail transiently
//! are re-issued through [`retry_transient`].

use crate::error::ErrorKind;
use crate::provider::ProviderError;
use crate::{log_debug, log_warn};
use rand::Rng;
use std::future::Future;
use tokio::time::{Duration, Instant, sleep};

/// Result of one status query.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus<T> {
    Pending { progress: Option<u8> },
    Succeeded(T),
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    /// 1.0 gives a fixed interval.
    pub multiplier: f64,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
            timeout: Duration::from_secs(3600),
        }
    }
}

impl PollPolicy {
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            multiplier: 1.0,
            timeout,
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let next = current.mul_f64(self.multiplier.max(1.0));
        next.min(self.max_interval.max(self.interval))
    }
}

/// Bounded re-issue of one provider call after a `Transient` failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallRetryPolicy {
    /// Re-issues after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CallRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Operation '{operation}' did not finish within {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Operation '{operation}' failed: {provider_message}")]
    OperationFailed {
        operation: String,
        provider_message: String,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl PollError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PollError::Timeout { .. } => ErrorKind::Timeout,
            PollError::OperationFailed { .. } => ErrorKind::OperationFailed,
            PollError::Provider(err) => err.kind(),
        }
    }
}

/// Poll `check` until it reports a terminal status or `policy.timeout` elapses.
///
/// Transient failures of the status query itself are logged and polled
/// through; any other query error ends the wait immediately.
pub async fn await_completion<T, F, Fut>(
    operation: &str,
    policy: &PollPolicy,
    mut check: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OperationStatus<T>, ProviderError>>,
{
    let started = Instant::now();
    let mut interval = policy.interval;

    loop {
        match check().await {
            Ok(OperationStatus::Succeeded(value)) => {
                log_debug!(operation, elapsed = ?started.elapsed(), "Operation succeeded");
                return Ok(value);
            }
            Ok(OperationStatus::Failed { message }) => {
                return Err(PollError::OperationFailed {
                    operation: operation.to_string(),
                    provider_message: message,
                });
            }
            Ok(OperationStatus::Pending { progress }) => {
                log_debug!(operation, ?progress, "Operation still running");
            }
            Err(err) if err.kind() == ErrorKind::Transient => {
                log_warn!(operation, error = %err, "Status query failed, polling again");
            }
            Err(err) => return Err(PollError::Provider(err)),
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(PollError::Timeout {
                operation: operation.to_string(),
                elapsed,
            });
        }

        let remaining = policy.timeout - elapsed;
        sleep(interval.min(remaining)).await;
        interval = policy.next_interval(interval);
    }
}

/// Run `call`, re-issuing it with capped exponential backoff while it fails
/// with a `Transient` error. Any other error, or the last transient one once
/// `policy.max_retries` is spent, is returned as is.
pub async fn retry_transient<T, F, Fut>(
    operation: &str,
    policy: &CallRetryPolicy,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0u32;

    loop {
        match call().await {
            Err(err) if err.kind() == ErrorKind::Transient && attempt < policy.max_retries => {
                attempt += 1;
                let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                log_warn!(operation, attempt, error = %err, "Provider call failed, retrying");
                sleep(backoff + Duration::from_millis(jitter_ms)).await;
                backoff = (backoff * 2).min(policy.max_backoff.max(policy.initial_backoff));
            }
            result => return result,
        }
    }
}
