//! Token-bucket rate limiter placed in front of the executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Allows `capacity` calls in a burst, refilled at `per_sec` tokens per
/// second. Shared by every call site of one client.
pub struct TokenBucket {
    capacity: f64,
    per_sec: f64,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// `capacity` is floored at 1 token.
    pub fn new(capacity: u32, per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = f64::from(capacity.max(1));
        let last_update = clock.now();
        Self {
            capacity,
            per_sec,
            clock,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_update,
            }),
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.take().is_none()
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        while let Some(wait) = self.take() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limited");
            self.clock.sleep(wait).await;
        }
    }

    /// Refill, then take a token or report how long until one exists.
    fn take(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_sec).min(self.capacity);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else if self.per_sec > 0.0 {
            let wait = (1.0 - bucket.tokens) / self.per_sec;
            Some(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
        } else {
            Some(Duration::from_secs(1))
        }
    }
}
