//! Backoff for the one-shot requests that hand out a code.
//!
//! Failures while polling are absorbed by the polling loop's attempt budget.
//! This policy only covers issuing a pairing session or device code, where a
//! transient fault would otherwise end the flow before it starts.

use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use crate::auth::AuthError;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Upper bound for any single wait, including server `Retry-After` hints.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Nominal wait before retry number `retry` (0-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    /// A rate-limit hint from the server replaces the computed backoff.
    fn delay_after(&self, retry: u32, error: &AuthError) -> Duration {
        if let AuthError::RateLimited {
            retry_after_ms: Some(ms),
        } = error
        {
            return Duration::from_millis(*ms).min(self.max_backoff);
        }
        jittered(self.backoff(retry))
    }

    /// Run `operation`, retrying transient failures only.
    ///
    /// Returns the first success, the first non-transient error, or the last
    /// transient error once `max_attempts` is used up.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, AuthError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AuthError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut retry = 0u32;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !error.is_transient() || retry + 1 >= max_attempts {
                return Err(error);
            }

            let delay = self.delay_after(retry, &error);
            tracing::warn!(
                attempt = retry + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "issue request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

/// Scale `delay` into 75%..125% of itself.
fn jittered(delay: Duration) -> Duration {
    let sample = Uuid::new_v4().as_u128() as u16;
    let factor = 0.75 + f64::from(sample) / f64::from(u16::MAX) * 0.5;
    delay.mul_f64(factor)
}
