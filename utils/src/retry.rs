//! Retry helpers shared by the executor's orchestrator and fetcher calls.
//!
//! - [`retry_with_backoff`] retries a fallible operation a bounded number of
//!   times with fixed or exponential backoff.
//! - [`poll_until_deadline`] polls a condition at a fixed interval until it
//!   yields a value or the deadline passes.

use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff strategy for [`retry_with_backoff`].
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: delay doubles each retry, capped at `max`.
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

    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay();
        for _ in 0..attempt {
            delay = self.next_delay(delay);
        }
        delay
    }
}

/// Retry an operation up to `max_retries` times with configurable backoff.
///
/// Total attempts = 1 + `max_retries`. Errors for which `is_retryable`
/// returns false are returned immediately.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    max_retries: u32,
    backoff: Backoff,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut delay = backoff.initial_delay();
    let mut attempt = 0;

    loop {
        match attempt_fn().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt >= max_retries {
                    return Err(e);
                }
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "attempt failed, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                delay = backoff.next_delay(delay);
                attempt += 1;
            }
        }
    }
}

/// Poll `check` every `interval` until it yields `Some(value)` or the
/// deadline passes, in which case `Ok(None)` is returned. Errors from
/// `check` end the polling immediately.
pub async fn poll_until_deadline<T, E, F, Fut>(
    deadline: Instant,
    interval: Duration,
    description: &str,
    mut check: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    loop {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            debug!(description, "deadline reached while polling");
            return Ok(None);
        }
        tokio::time::sleep(std::cmp::min(interval, deadline - now)).await;
    }
}
