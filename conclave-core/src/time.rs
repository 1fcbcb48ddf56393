//! Time provider abstraction.
//!
//! All waits in the engine go through [`TimeProvider`], so timeouts and
//! backoff behave identically whether the clock is the real one or a test
//! harness clock.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
///
/// `now()` is monotonic time since provider creation, returned as a
/// `Duration` so it can be compared and subtracted without caring about an
/// epoch. Protocol timestamps (detector silence windows, machine activity)
/// are stored in these units.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Monotonic time since provider creation.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout,
    /// or `Err(TimeError::Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>;
}

/// Real time provider using tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: std::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>,
    {
        match tokio::time::timeout(duration, future).await {
            Ok(result) => Ok(result),
            Err(_) => Err(TimeError::Elapsed),
        }
    }
}
