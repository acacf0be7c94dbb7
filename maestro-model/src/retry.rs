use maestro_core::{MaestroError, Result};
use std::future::Future;
use std::time::Duration;

/// Retry policy for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let millis = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }
}

/// Rate limits and upstream hiccups are retryable; everything else is not.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

pub fn is_retryable_model_error(err: &MaestroError) -> bool {
    match err {
        MaestroError::Model(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("429")
                || msg.contains("rate limit")
                || msg.contains("overloaded")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timed out")
        }
        _ => false,
    }
}

/// Run `operation` with exponential backoff on retryable errors.
pub async fn execute_with_retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_retries && is_retryable_model_error(&err) => {
                let delay = config.backoff_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable model error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
