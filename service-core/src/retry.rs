//! Bounded retry with exponential backoff for calls to collaborator services.
//!
//! Every attempt runs under a timeout; only errors flagged retryable (see
//! [`AppError::is_retryable`]) are attempted again.

use crate::error::AppError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Small backoffs, for tests and interactive paths.
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            add_jitter: false,
            attempt_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            // up to 25%
            let jitter = (backoff_ms as f64 * 0.25 * rand::thread_rng().gen_range(0.0..1.0)) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

/// Run `f` until it succeeds, fails permanently, or retries are exhausted.
///
/// A timed-out attempt counts as a transient failure of `service`.
pub async fn retry_call<F, Fut, T>(
    config: &RetryConfig,
    service: &'static str,
    operation_name: &str,
    f: F,
) -> Result<T, AppError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;

    loop {
        let outcome = match timeout(config.attempt_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::transient(
                service,
                format!(
                    "{} timed out after {}ms",
                    operation_name,
                    config.attempt_timeout.as_millis()
                ),
            )),
        };

        match outcome {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        service,
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Call succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_retryable() => {
                warn!(
                    service,
                    operation = operation_name,
                    error = %err,
                    "Call failed with permanent error, not retrying"
                );
                return Err(err);
            }
            Err(err) if attempt >= config.max_retries => {
                warn!(
                    service,
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %err,
                    "Call failed after max retries"
                );
                return Err(err);
            }
            Err(err) => {
                let backoff = config.backoff_duration(attempt);
                warn!(
                    service,
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "Call failed, retrying after backoff"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
