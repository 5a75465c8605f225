//! Exponential backoff for transient store errors during a drain.
//!
//! Only errors with [`StoreError::is_transient`] are retried. Anything else is
//! returned after the first attempt.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// 3 retries with 500ms, 1s, 2s delays.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 2.0,
    };

    pub const NONE: Self = Self {
        max_retries: 0,
        ..Self::DEFAULT
    };

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Delay before retry number `attempt` (0-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug)]
pub enum RetryResult<T> {
    Success { value: T, retries: u32 },
    /// Transient errors on every attempt
    ExhaustedRetries { last_error: StoreError, attempts: u32 },
    PermanentError(StoreError),
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn retry_transient<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                return RetryResult::Success {
                    value,
                    retries: attempt,
                }
            }
            Err(e) if !e.is_transient() => return RetryResult::PermanentError(e),
            Err(e) if attempt >= config.max_retries => {
                return RetryResult::ExhaustedRetries {
                    last_error: e,
                    attempts: attempt + 1,
                }
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt + 1,
                    config.max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
