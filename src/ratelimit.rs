use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rolling-window limiter: at most `max_calls` acquisitions in any `window`.
/// Pruning and appending happen under one lock, so concurrent callers can
/// never overshoot the limit.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    /// `max_calls == 0` disables limiting.
    pub fn is_unlimited(&self) -> bool {
        self.max_calls == 0
    }

    /// Waits until a call slot is free and claims it.
    pub async fn acquire(&self) {
        if self.is_unlimited() {
            return;
        }
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    calls.pop_front();
                }
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }
                match calls.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "llm rate limit reached; waiting");
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn in_window(&self) -> usize {
        let mut calls = self.calls.lock().await;
        let now = Instant::now();
        calls.retain(|t| now.duration_since(*t) < self.window);
        calls.len()
    }
}
