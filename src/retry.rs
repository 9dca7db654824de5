use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Attempt cap plus exponential backoff. Which errors are worth another attempt
/// is decided by the predicate passed to [`RetryPolicy::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    pub async fn run<T, E, F, Fut, P>(
        &self,
        label: &str,
        is_retryable: P,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1u32;
        loop {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_retryable(&err) => {
                    tracing::warn!(
                        op = label,
                        attempt,
                        attempts = self.max_attempts,
                        error = %err,
                        "transient failure; retrying"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
