// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two loops share one [`RetryPolicy`]:
//! - [`retry`] retries any fallible operation (used for connecting pools at
//!   startup, where every error is worth another try).
//! - [`call_with_retry`] wraps an adapter call: it applies the per-call
//!   timeout, only retries errors the [`AdapterError`] taxonomy marks as
//!   transient, stretches the delay on rate limits and can be cut short by a
//!   shutdown signal.
//!
//! # Example
//!
//! ```
//! use tristore_sync::RetryPolicy;
//! use std::time::Duration;
//!
//! // Adapter calls: 5 attempts, 1s, 2s, 4s, 8s between them
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.max_attempts, 5);
//! assert_eq!(policy.delay_for(3), Duration::from_secs(8));
//!
//! // Startup: fail fast on bad config
//! let startup = RetryPolicy::startup();
//! assert!(startup.initial_delay < Duration::from_secs(1));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::record::StoreKind;
use crate::storage::traits::AdapterError;

/// Backoff schedule for retried operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Applied to the current delay when the store reports `RateLimited`
    pub rate_limit_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            factor: 2.0,
            rate_limit_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~3 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self::new(5, Duration::from_millis(200), Duration::from_secs(2))
    }

    /// Millisecond delays, for tests and demos
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::from_millis(1), Duration::from_millis(8))
    }

    /// Delay before retry number `retry` (0-based): `initial * factor^retry`, capped.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(retry as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// How long to wait after `err`, given the plain exponential `delay`.
    ///
    /// Rate limits wait for the longer of the store's hint and the stretched
    /// delay; both are capped by `max_delay`.
    #[must_use]
    pub fn backoff(&self, delay: Duration, err: &AdapterError) -> Duration {
        match err {
            AdapterError::RateLimited { retry_after } => {
                let stretched = delay.mul_f64(self.rate_limit_multiplier);
                retry_after.unwrap_or_default().max(stretched).min(self.max_delay)
            }
            _ => delay.min(self.max_delay),
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;

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
                if attempts >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(attempts - 1);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, policy.max_attempts, err, delay
                );
                sleep(delay).await;
            }
        }
    }
}

/// Final state of a retried adapter call.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded(T),
    /// Permanent error, or transient errors until attempts ran out
    Failed(AdapterError),
    /// Shutdown interrupted a backoff sleep; no call was in flight
    Aborted(AdapterError),
}

/// A retried call together with how many times the adapter was invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub outcome: RetryOutcome<T>,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    #[must_use]
    pub fn into_result(self) -> Result<T, AdapterError> {
        match self.outcome {
            RetryOutcome::Succeeded(v) => Ok(v),
            RetryOutcome::Failed(e) | RetryOutcome::Aborted(e) => Err(e),
        }
    }
}

/// Run an adapter call under `policy`, bounding each attempt by `timeout`.
///
/// `Rejected` and `NotFound` return after the first attempt. An elapsed
/// timeout counts as `Unavailable`.
pub async fn call_with_retry<T, F, Fut>(
    store: StoreKind,
    operation: &'static str,
    policy: &RetryPolicy,
    timeout: Duration,
    shutdown: Option<&watch::Receiver<bool>>,
    mut call: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => {
                crate::metrics::record_timeout(store.as_str(), operation);
                Err(AdapterError::Unavailable(format!("timed out after {:?}", timeout)))
            }
        };

        let err = match result {
            Ok(value) => {
                if attempts > 1 {
                    info!(%store, operation, attempts, "Store call succeeded after retries");
                }
                return Attempted { outcome: RetryOutcome::Succeeded(value), attempts };
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            debug!(%store, operation, error = %err, "Permanent store error, not retrying");
            return Attempted { outcome: RetryOutcome::Failed(err), attempts };
        }
        if attempts >= policy.max_attempts {
            warn!(%store, operation, attempts, error = %err, "Retries exhausted");
            return Attempted { outcome: RetryOutcome::Failed(err), attempts };
        }

        let wait = policy.backoff(policy.delay_for(attempts - 1), &err);
        crate::metrics::record_retry(store.as_str(), operation, err.kind());
        warn!(
            %store, operation, attempt = attempts, max = policy.max_attempts, error = %err,
            "Transient store error, retrying in {:?}", wait
        );
        if !sleep_unless_shutdown(wait, shutdown).await {
            info!(%store, operation, attempts, "Backoff aborted by shutdown");
            return Attempted { outcome: RetryOutcome::Aborted(err), attempts };
        }
    }
}

/// Sleep for `wait`; `false` if the shutdown flag went up first.
async fn sleep_unless_shutdown(wait: Duration, shutdown: Option<&watch::Receiver<bool>>) -> bool {
    let Some(rx) = shutdown else {
        sleep(wait).await;
        return true;
    };
    let mut rx = rx.clone();
    if *rx.borrow() {
        return false;
    }

    let deadline = Instant::now() + wait;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return true,
            changed = rx.changed() => match changed {
                Ok(()) if *rx.borrow_and_update() => return false,
                Ok(()) => continue,
                Err(_) => {
                    // Sender gone: nobody can ask us to stop any more.
                    sleep_until(deadline).await;
                    return true;
                }
            },
        }
    }
}
