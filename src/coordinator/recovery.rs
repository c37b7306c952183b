//! Retry and recovery for transient collaborator failures
//!
//! Token issuance and media-session connects can fail transiently; both are
//! retried with exponential backoff and jitter before the failure is treated
//! as genuine. Permission denials and other non-retryable errors exit the
//! loop immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{CallError, CallResult};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Quick retries for short network operations (token fetch, connect)
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let mut millis = exp.min(self.max_delay.as_millis() as f64) as u64;
        if self.use_jitter && millis > 0 {
            millis += rand::thread_rng().gen_range(0..=millis / 4);
        }
        Duration::from_millis(millis)
    }
}

/// Run `operation` until it succeeds, the error is non-retryable, or the
/// attempt budget runs out
pub async fn retry_with_backoff<F, Fut, T>(
    operation_name: &str,
    config: RetryConfig,
    mut operation: F,
) -> CallResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CallResult<T>>,
{
    let mut last_error = None;
    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt + 1);
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(
                    "{} failed on attempt {}/{}: {}",
                    operation_name,
                    attempt + 1,
                    config.max_attempts,
                    err
                );
                last_error = Some(err);
                if attempt + 1 < config.max_attempts {
                    sleep(config.delay_for_attempt(attempt)).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or(CallError::InternalError {
        message: format!("{} retried with zero attempts", operation_name),
    }))
}
