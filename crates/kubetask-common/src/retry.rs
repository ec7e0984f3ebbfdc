//! Exponential backoff with jitter for transient cluster calls
//!
//! Used where the engine must wait for the cluster to catch up, e.g. a pod
//! whose container has not started yet when the log relay wants its stream.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff settings for a retried operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = until cancelled)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Outcome of [`retry_until_cancelled`]
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation eventually succeeded
    Done(T),
    /// Attempts were exhausted; carries the last error
    Exhausted(E),
    /// The token fired before the operation succeeded
    Cancelled,
}

/// Retry an async operation with exponential backoff and jitter until it
/// succeeds, attempts run out, or `token` is cancelled.
///
/// Cancellation is observed both while an attempt is in flight and while
/// sleeping between attempts.
pub async fn retry_until_cancelled<F, Fut, T, E>(
    config: &RetryConfig,
    token: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = token.cancelled() => return RetryOutcome::Cancelled,
            r = operation() => r,
        };

        let err = match result {
            Ok(value) => return RetryOutcome::Done(value),
            Err(e) => e,
        };

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            warn!(
                operation = %operation_name,
                attempt,
                error = %err,
                "giving up after max attempts"
            );
            return RetryOutcome::Exhausted(err);
        }

        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        debug!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis() as u64,
            "attempt failed, retrying"
        );

        tokio::select! {
            _ = token.cancelled() => return RetryOutcome::Cancelled,
            _ = tokio::time::sleep(jittered) => {}
        }

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
