//! Per-user token-bucket rate limiting, enforced at orchestrator entry.

use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    burst: f64,
    per_second: f64,
    buckets: Mutex<HashMap<Uuid, Bucket>>,
}

impl RateLimiter {
    pub fn new(burst: u32, per_minute: u32) -> Self {
        Self {
            burst: burst as f64,
            per_second: per_minute as f64 / 60.0,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for the user, or fail with the seconds until the
    /// next token becomes available.
    pub async fn acquire(&self, user_id: Uuid) -> Result<()> {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(user_id).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / self.per_second).ceil() as u64;
            Err(Error::RateLimited { retry_after_secs: retry_after_secs.max(1) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_honored_then_limited() {
        let limiter = RateLimiter::new(3, 60);
        let user = Uuid::new_v4();
        for _ in 0..3 {
            limiter.acquire(user).await.unwrap();
        }
        match limiter.acquire(user).await {
            Err(Error::RateLimited { retry_after_secs }) => assert!(retry_after_secs >= 1),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn users_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 60);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        limiter.acquire(a).await.unwrap();
        limiter.acquire(b).await.unwrap();
        assert!(limiter.acquire(a).await.is_err());
    }
}
