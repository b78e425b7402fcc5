use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Global request budget shared by every fetch in a sweep. `acquire` blocks
/// until a token is free; no caller starves because waiters retry against the
/// same sliding window.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn acquire(&self);
}

/// Leaky-bucket limiter: at most `max_requests` acquisitions inside any
/// window of `window_seconds`.
pub struct TokenBucket {
    max_requests: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

pub const DEFAULT_MAX_REQUESTS: usize = 3;
pub const DEFAULT_WINDOW_SECONDS: u64 = 2;

impl TokenBucket {
    pub fn new(max_requests: usize, window_seconds: u64) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window: Duration::from_secs(window_seconds.max(1)),
            stamps: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_SECONDS)
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut stamps = self.stamps.lock().await;
                let now = Instant::now();
                while let Some(front) = stamps.front() {
                    if now.duration_since(*front) >= self.window {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }
                if stamps.len() < self.max_requests {
                    stamps.push_back(now);
                    return;
                }
                // Oldest in-window stamp decides when the next token frees up.
                let front = *stamps.front().unwrap_or(&now);
                self.window.saturating_sub(now.duration_since(front))
            };
            sleep(wait.max(Duration::from_millis(10))).await;
        }
    }
}

/// Limiter that never blocks, for tests and dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLimiter;

#[async_trait]
impl RateLimiter for NoopLimiter {
    async fn acquire(&self) {}
}
