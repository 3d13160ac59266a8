//! Backoff retry for establishing the cluster connection.
//!
//! Convergence checks never retry on their own; they go through
//! [`crate::poll`]. This module only covers the setup step where the API
//! server may briefly refuse connections (port-forward restarts, proxy warmup).

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff settings for a retried setup operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (at least one is always made)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Run `operation` until it succeeds or `max_attempts` is exhausted.
///
/// Delays grow exponentially up to `max_delay`, each scaled by a random
/// jitter factor in `0.5..1.5`. Returns the last error on exhaustion.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(e);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = jittered_delay.as_millis(),
            "Operation failed, retrying"
        );
        tokio::time::sleep(jittered_delay).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
