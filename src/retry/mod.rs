// Retry policy shared by every provider call site


use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::http::ProviderError;

const EXPONENTIAL_BACKOFF_BASE: u32 = 2;

/// Exponential backoff with jitter, bounded by an attempt limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Fraction of the delay randomised in both directions, 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// The call kept failing, or failed permanently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: ProviderError,
}

impl RetryPolicy {
    #[inline]
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Delay before the attempt that follows attempt number `attempt` (1-based)
    #[inline]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let nominal = self
            .base_delay
            .saturating_mul(EXPONENTIAL_BACKOFF_BASE.pow(exponent))
            .min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }

        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor).min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently or the attempt budget runs out
    #[inline]
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("{} attempt {}/{}", operation, attempt, max_attempts);

            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => {
                    warn!("{} failed with non-retryable error: {}", operation, error);
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }
                Err(error) if attempt >= max_attempts => {
                    error!(
                        "{} failed after {} attempt(s): {}",
                        operation, attempt, error
                    );
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }
                Err(error) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        operation, attempt, max_attempts, error, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
