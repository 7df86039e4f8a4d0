// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rate-limited request gate for the source CRM API.
//!
//! Every outbound call goes through [`RequestGate::execute`]. The gate
//! enforces two independent limits before each attempt:
//!
//! - **Window**: at most `requests_per_minute` attempts start inside any
//!   sliding one-minute window. When the window is full the caller waits
//!   until the oldest attempt ages out.
//! - **Spacing**: consecutive attempts are at least `window / ceiling`
//!   apart, so bursts are smoothed even when the window has room.
//!
//! Calls queue on a fair mutex, so they are served in arrival order and
//! run one at a time (including their retries). Callers must not rely on
//! that ordering for correctness.
//!
//! # Example
//!
//! ```
//! use crm_sync::{RequestGate, GateConfig};
//! use crm_sync::source::ApiError;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let gate = RequestGate::new(GateConfig::keap());
//! let value = gate
//!     .execute("ping", || async { Ok::<_, ApiError>(7) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 7);
//! # }
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::retry::{retry, RetryConfig, Transient};
use crate::source::ApiError;

/// Gate limits and retry schedule.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Ceiling of attempts per `window`
    pub requests_per_minute: u32,
    pub window: Duration,
    /// Attempts per call, including the first
    pub max_attempts: u32,
    /// Backoff multiplier; retry `n` waits `backoff_base^n` units
    pub backoff_base: f64,
    pub backoff_unit: Duration,
    pub jitter: f64,
}

impl GateConfig {
    /// Keap-style budget: 1400/min (provider hard limit is 1500/min),
    /// three attempts, 1s/2s backoff.
    #[must_use]
    pub fn keap() -> Self {
        Self {
            requests_per_minute: 1400,
            window: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
            jitter: 0.1,
        }
    }

    /// Generous ceiling and millisecond backoff for tests.
    #[must_use]
    pub fn test() -> Self {
        Self {
            requests_per_minute: 60_000,
            window: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_millis(1),
            jitter: 0.0,
        }
    }

    /// Minimum spacing between two consecutive attempts.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.window / self.requests_per_minute.max(1)
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: self.backoff_unit,
            max_delay: self.window,
            factor: self.backoff_base,
            max_attempts: self.max_attempts.max(1),
            jitter: self.jitter,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::keap()
    }
}

/// Terminal failure of a gated call.
#[derive(Debug, Error)]
pub enum GateError {
    /// Non-retryable failure (client error, missing credentials), returned
    /// on the attempt that produced it.
    #[error("{0}")]
    Rejected(ApiError),

    /// Every attempt failed transiently.
    #[error("request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ApiError },
}

impl GateError {
    /// The failure of the final attempt.
    #[must_use]
    pub fn api_error(&self) -> &ApiError {
        match self {
            Self::Rejected(e) | Self::Exhausted { last: e, .. } => e,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.api_error().status()
    }
}

/// Point-in-time view of gate usage.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GateStats {
    /// Attempts started in the current window
    pub window_requests: usize,
    /// Calls waiting for their turn
    pub queued: usize,
    /// Attempts started since the gate was created
    pub total_requests: u64,
    /// Time until the oldest attempt leaves the window
    pub until_slot_free_ms: u64,
}

#[derive(Debug, Default)]
struct WindowState {
    /// Start times of attempts still inside the window, oldest first
    sent: VecDeque<Instant>,
    last: Option<Instant>,
}

impl WindowState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.sent.front() {
            if now.duration_since(oldest) >= window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Single shared quota for one external API.
///
/// Construct one per process and hand out `Arc<RequestGate>`; the counters
/// are the only mutable in-process state of a sync run.
pub struct RequestGate {
    config: GateConfig,
    retry: RetryConfig,
    /// FIFO turn-taking; tokio's mutex queues waiters fairly
    turn: tokio::sync::Mutex<()>,
    window: Mutex<WindowState>,
    queued: AtomicUsize,
    total: AtomicU64,
}

impl RequestGate {
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        let retry = config.retry_config();
        Self {
            config,
            retry,
            turn: tokio::sync::Mutex::new(()),
            window: Mutex::new(WindowState::default()),
            queued: AtomicUsize::new(0),
            total: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Run `request` under the rate limit, retrying transient failures.
    ///
    /// `request` is invoked once per attempt; each attempt takes its own
    /// slot in the window.
    pub async fn execute<F, Fut, T>(&self, label: &str, mut request: F) -> Result<T, GateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.queued.fetch_add(1, Ordering::Relaxed);
        let _turn = self.turn.lock().await;
        self.queued.fetch_sub(1, Ordering::Relaxed);

        let mut attempts: u32 = 0;
        let result = retry(label, &self.retry, || {
            attempts += 1;
            let attempt = request();
            async move {
                self.acquire_slot().await;
                attempt.await
            }
        })
        .await;

        result.map_err(|err| {
            if err.is_transient() {
                GateError::Exhausted { attempts, last: err }
            } else {
                GateError::Rejected(err)
            }
        })
    }

    /// Wait until both the window and the spacing rule allow another
    /// attempt, then claim it.
    async fn acquire_slot(&self) {
        let ceiling = self.config.requests_per_minute.max(1) as usize;
        let min_interval = self.config.min_interval();

        loop {
            let wait = {
                let mut state = self.window.lock();
                let now = Instant::now();
                state.prune(now, self.config.window);

                let window_wait = if state.sent.len() >= ceiling {
                    state
                        .sent
                        .front()
                        .map(|&oldest| (oldest + self.config.window).saturating_duration_since(now))
                        .unwrap_or_default()
                } else {
                    Duration::ZERO
                };
                let spacing_wait = state
                    .last
                    .map(|last| (last + min_interval).saturating_duration_since(now))
                    .unwrap_or_default();

                let wait = window_wait.max(spacing_wait);
                if wait.is_zero() {
                    state.sent.push_back(now);
                    state.last = Some(now);
                    self.total.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                if !window_wait.is_zero() {
                    debug!(wait_ms = window_wait.as_millis() as u64, "Rate window full, waiting");
                }
                wait
            };

            crate::metrics::record_gate_wait(wait);
            sleep(wait).await;
        }
    }

    #[must_use]
    pub fn stats(&self) -> GateStats {
        let mut state = self.window.lock();
        let now = Instant::now();
        state.prune(now, self.config.window);
        let until_free = state
            .sent
            .front()
            .map(|&oldest| (oldest + self.config.window).saturating_duration_since(now))
            .unwrap_or_default();
        GateStats {
            window_requests: state.sent.len(),
            queued: self.queued.load(Ordering::Relaxed),
            total_requests: self.total.load(Ordering::Relaxed),
            until_slot_free_ms: until_free.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast_config(rpm: u32) -> GateConfig {
        GateConfig {
            requests_per_minute: rpm,
            window: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
            jitter: 0.0,
        }
    }

    fn server_error() -> ApiError {
        ApiError::Status { status: 503, message: "unavailable".into(), retry_after: None }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_between_consecutive_requests() {
        let gate = RequestGate::new(fast_config(60)); // 1s spacing
        let start = Instant::now();

        for _ in 0..3 {
            gate.execute("t", || async { Ok::<_, ApiError>(()) }).await.unwrap();
        }

        // first immediate, then 1s, 1s
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_ceiling_blocks_until_reset() {
        let mut config = fast_config(5);
        config.window = Duration::from_secs(10); // spacing 2s
        let gate = RequestGate::new(config);
        let start = Instant::now();

        for _ in 0..6 {
            gate.execute("t", || async { Ok::<_, ApiError>(()) }).await.unwrap();
        }

        // 5 requests at 0,2,4,6,8; the 6th waits for the first to age out at 10
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(gate.stats().total_requests, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_rejected_without_retry() {
        let gate = RequestGate::new(fast_config(1000));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let err = gate
            .execute("t", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ApiError::Status { status: 404, message: "nope".into(), retry_after: None })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GateError::Rejected(_)));
        assert_eq!(err.status(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_with_last_message() {
        let gate = RequestGate::new(fast_config(1000));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let err = gate
            .execute("t", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(server_error())
                }
            })
            .await
            .unwrap_err();

        match err {
            GateError::Exhausted { attempts, ref last } => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("unavailable"));
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_consumes_a_slot() {
        let gate = RequestGate::new(fast_config(1000));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        gate.execute("t", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(server_error())
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(gate.stats().total_requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_budget() {
        let mut config = fast_config(4);
        config.window = Duration::from_secs(4); // spacing 1s
        let gate = Arc::new(RequestGate::new(config));
        let start = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move {
                    gate.execute("t", || async { Ok::<_, ApiError>(()) }).await.unwrap();
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        // 8 attempts spaced 1s apart → last starts at 7s
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert_eq!(gate.stats().total_requests, 8);
    }

    #[test]
    fn test_min_interval_formula() {
        let config = fast_config(1400);
        assert_eq!(config.min_interval(), Duration::from_secs(60) / 1400);
    }
}
