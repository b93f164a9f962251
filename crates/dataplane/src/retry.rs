//! Retry and backoff helpers.
//!
//! - [`retry_with_backoff`] retries up to a fixed number of attempts, used
//!   when connecting to the container engine.
//! - [`poll_until_deadline`] polls a condition until it holds or a deadline
//!   passes, used for the grace wait after restarting a container.
//! - [`Backoff::delay_after`] turns a count of consecutive failures into a
//!   sleep, used by the pool's reconciliation loop.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

/// Backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Delay doubles each retry, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn initial_delay(&self) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, .. } => *initial,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { max, .. } => std::cmp::min(current * 2, *max),
        }
    }

    /// Delay to wait after `failures` consecutive failures.
    ///
    /// Zero failures yields the initial delay; each further failure doubles
    /// it (for exponential backoff) up to the cap.
    pub fn delay_after(&self, failures: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(failures.min(31));
                initial.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// Retry an operation up to `max_retries` times with the given backoff.
///
/// Total attempts = 1 + `max_retries`. Errors for which `is_retryable`
/// returns false are returned immediately.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    max_retries: u32,
    backoff: Backoff,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut delay = backoff.initial_delay();
    let mut attempt = 0;

    loop {
        match attempt_fn().await {
            Ok(val) => return Ok(val),
            Err(e) if !is_retryable(&e) || attempt == max_retries => return Err(e),
            Err(e) => {
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "Attempt failed, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                delay = backoff.next_delay(delay);
                attempt += 1;
            }
        }
    }
}

/// Poll `check` until it returns `Ok(true)` or `timeout` elapses.
///
/// Returns whether the condition was observed. Errors from `check` count as
/// "not yet" and are logged at debug level.
pub async fn poll_until_deadline<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    description: &str,
    mut check: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match check().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => debug!(error = %e, description, "Poll check failed"),
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(std::cmp::min(poll_interval, deadline - now)).await;
    }
}
