//! Retry utilities with exponential backoff and jitter.
//!
//! Used for operations that fail transiently and should be retried until
//! they succeed, run out of attempts, or the caller shuts down, most notably
//! re-dialing the parent cluster after a tunnel drops.
//!
//! # Example
//!
//! ```ignore
//! use arbor_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let stream = retry_with_backoff(
//!     &RetryConfig::default(),
//!     "dial_parent",
//!     &cancel,
//!     || async { TcpStream::connect(addr).await },
//! ).await?;
//! ```

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Backoff parameters for a retried operation.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
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

    /// Delays between consecutive attempts, before jitter
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            multiplier: self.backoff_multiplier,
        }
    }
}

/// Unbounded iterator of exponentially growing delays, capped at `max`
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.max);
        self.next = current.mul_f64(self.multiplier).min(self.max);
        Some(current)
    }
}

/// Scale a delay by a random factor in [0.5, 1.5)
pub fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Why a retried operation gave up
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// `max_attempts` reached; carries the last error
    Exhausted(E),
    /// The cancellation token fired first
    Cancelled,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted(e) => write!(f, "retries exhausted: {}", e),
            RetryError::Cancelled => write!(f, "retry cancelled"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, until `max_attempts` is exhausted, or until
/// `cancel` fires, whichever comes first. Cancellation is honored both
/// between attempts and while an attempt is in flight.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0u32;
    let mut delays = config.delays();

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = operation() => outcome,
        };

        let e = match outcome {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(RetryError::Exhausted(e));
        }

        let delay = jitter(delays.next().unwrap_or(config.max_delay));
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
