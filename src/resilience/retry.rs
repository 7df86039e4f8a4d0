// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Errors opt into classification through [`Transient`]: non-transient
//! failures propagate on the first attempt, and a failure carrying its own
//! retry hint (an HTTP `Retry-After`) waits for that hint instead of the
//! backoff schedule.
//!
//! # Example
//!
//! ```
//! use crm_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//!
//! // Source API: 1s, 2s between the three attempts
//! let api = RetryConfig::source_api(3, 2.0, 0.0);
//! assert_eq!(api.delay_for(0), Duration::from_secs(1));
//! assert_eq!(api.delay_for(1), Duration::from_secs(2));
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Classification hook for errors passed through [`retry`].
pub trait Transient {
    /// Whether another attempt could succeed.
    fn is_transient(&self) -> bool {
        true
    }

    /// Server-provided delay before the next attempt, when known.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Configuration for operation retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied per retry (the backoff base)
    pub factor: f64,
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Fraction of each delay randomized in either direction
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial backend connections.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Quick retry for individual store queries.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Source API schedule: retry `n` waits `base^n` seconds (n from 0).
    #[must_use]
    pub fn source_api(max_attempts: u32, base: f64, jitter: f64) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: base,
            jitter,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay before retry number `retry` (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Run `operation` until it succeeds, fails non-transiently, or exhausts
/// `config.max_attempts`. The last error is returned as-is.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Transient,
{
    let mut attempts: u32 = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !err.is_transient() {
                    return Err(err);
                }
                if attempts >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %err,
                        "Operation failed, retries exhausted"
                    );
                    return Err(err);
                }

                let delay = match err.retry_after() {
                    Some(hint) => hint,
                    None => config.jittered(config.delay_for(attempts - 1)),
                };
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, config.max_attempts, err, delay
                );
                crate::metrics::record_retry(operation_name);

                sleep(delay).await;
            }
        }
    }
}
