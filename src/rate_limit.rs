//! Token-bucket rate limiting for external-call budgets.
//!
//! One bucket guards the global scoring-provider budget; additional buckets
//! are created lazily per caller key for the API surface. Buckets are the
//! only state mutated concurrently by the batch workers, so all updates go
//! through a single decrement-and-check under the bucket mutex.
//!
//! Ingress per-IP limiting is handled separately by tower_governor in
//! `main.rs`; this module is for budgets the pipeline itself must honor.

use crate::errors::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Capacity and refill rate for one bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    /// Burst capacity: the maximum number of tokens the bucket holds.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

/// Granted permit with the information response headers need.
#[derive(Debug, Clone, Copy)]
pub struct Permit {
    /// Whole tokens left after this acquisition.
    pub remaining: u32,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
}

/// Rate-limit scope: the shared provider budget or a per-caller budget.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    Global,
    Caller(&'a str),
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

struct TokenBucket {
    config: BucketConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Atomic decrement-and-check. On failure returns the estimated wait
    /// until `cost` tokens accumulate, or `None` when the bucket never
    /// refills.
    fn try_acquire(&self, cost: u32) -> Result<Permit, Option<Duration>> {
        let mut state = self.state.lock().expect("bucket mutex poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.config.refill_per_sec)
            .min(self.config.capacity as f64);
        state.last_refill = now;

        if state.tokens >= cost as f64 {
            state.tokens -= cost as f64;
            let deficit = self.config.capacity as f64 - state.tokens;
            let reset_after = if self.config.refill_per_sec > 0.0 {
                Duration::from_secs_f64(deficit / self.config.refill_per_sec)
            } else {
                Duration::ZERO
            };
            Ok(Permit {
                remaining: state.tokens.floor() as u32,
                reset_after,
            })
        } else if self.config.refill_per_sec > 0.0 {
            let needed = cost as f64 - state.tokens;
            Err(Some(Duration::from_secs_f64(
                needed / self.config.refill_per_sec,
            )))
        } else {
            Err(None)
        }
    }

    fn remaining(&self) -> u32 {
        let mut state = self.state.lock().expect("bucket mutex poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.config.refill_per_sec)
            .min(self.config.capacity as f64);
        state.last_refill = now;
        state.tokens.floor() as u32
    }
}

/// Shared rate limiter injected into the pipeline and handlers.
pub struct RateLimiter {
    global: TokenBucket,
    caller_config: BucketConfig,
    callers: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(global: BucketConfig, per_caller: BucketConfig) -> Self {
        Self {
            global: TokenBucket::new(global),
            caller_config: per_caller,
            callers: Mutex::new(HashMap::new()),
        }
    }

    fn caller_bucket(&self, key: &str) -> Arc<TokenBucket> {
        let mut callers = self.callers.lock().expect("caller map mutex poisoned");
        callers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.caller_config)))
            .clone()
    }

    /// Acquires `cost` tokens from the scoped bucket, suspending until they
    /// are available or `deadline` elapses.
    ///
    /// Returns a `Permit` on success; fails with `RateLimited` carrying a
    /// retry-after hint when the deadline expires first.
    pub async fn acquire(
        &self,
        scope: Scope<'_>,
        cost: u32,
        deadline: Duration,
    ) -> Result<Permit, AppError> {
        let caller_bucket;
        let bucket: &TokenBucket = match scope {
            Scope::Global => &self.global,
            Scope::Caller(key) => {
                caller_bucket = self.caller_bucket(key);
                &caller_bucket
            }
        };

        let deadline_at = Instant::now() + deadline;
        loop {
            let wait = match bucket.try_acquire(cost) {
                Ok(permit) => return Ok(permit),
                Err(wait) => wait,
            };

            let now = Instant::now();
            if now >= deadline_at {
                let retry_after_secs = wait
                    .map(|d| d.as_secs().max(1))
                    .unwrap_or_else(|| deadline.as_secs().max(1));
                return Err(AppError::RateLimited { retry_after_secs });
            }

            let until_deadline = deadline_at - now;
            let nap = wait.unwrap_or(until_deadline).min(until_deadline);
            // A floor keeps the zero-refill case from busy-looping.
            tokio::time::sleep(nap.max(Duration::from_millis(5))).await;
        }
    }

    /// Non-blocking read of the scoped bucket's whole-token count, used for
    /// `X-RateLimit-Remaining` headers.
    pub fn remaining(&self, scope: Scope<'_>) -> u32 {
        match scope {
            Scope::Global => self.global.remaining(),
            Scope::Caller(key) => self.caller_bucket(key).remaining(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_refill(capacity: u32) -> BucketConfig {
        BucketConfig {
            capacity,
            refill_per_sec: 0.0,
        }
    }

    #[tokio::test]
    async fn capacity_grants_exactly_c_under_contention() {
        let limiter = Arc::new(RateLimiter::new(zero_refill(3), zero_refill(100)));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .acquire(Scope::Global, 1, Duration::from_millis(50))
                    .await
            }));
        }

        let mut granted = 0;
        let mut limited = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(AppError::RateLimited { .. }) => limited += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(limited, 7);
    }

    #[tokio::test]
    async fn blocked_acquire_succeeds_after_refill() {
        let limiter = RateLimiter::new(
            BucketConfig {
                capacity: 1,
                refill_per_sec: 20.0,
            },
            zero_refill(100),
        );

        limiter
            .acquire(Scope::Global, 1, Duration::from_millis(10))
            .await
            .unwrap();

        // Bucket is empty; the second acquire must wait ~50ms for a token.
        let start = Instant::now();
        limiter
            .acquire(Scope::Global, 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn deadline_expiry_reports_retry_after() {
        let limiter = RateLimiter::new(zero_refill(1), zero_refill(100));
        limiter
            .acquire(Scope::Global, 1, Duration::from_millis(10))
            .await
            .unwrap();

        let err = limiter
            .acquire(Scope::Global, 1, Duration::from_millis(20))
            .await
            .unwrap_err();
        match err {
            AppError::RateLimited { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("expected RateLimited, got {}", other),
        }
    }

    #[tokio::test]
    async fn caller_scopes_are_isolated() {
        let limiter = RateLimiter::new(zero_refill(100), zero_refill(1));

        limiter
            .acquire(Scope::Caller("key-a"), 1, Duration::from_millis(10))
            .await
            .unwrap();
        // key-a is exhausted, key-b is untouched.
        assert!(limiter
            .acquire(Scope::Caller("key-a"), 1, Duration::from_millis(10))
            .await
            .is_err());
        assert!(limiter
            .acquire(Scope::Caller("key-b"), 1, Duration::from_millis(10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn remaining_reflects_spent_tokens() {
        let limiter = RateLimiter::new(zero_refill(5), zero_refill(100));
        assert_eq!(limiter.remaining(Scope::Global), 5);
        limiter
            .acquire(Scope::Global, 2, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(limiter.remaining(Scope::Global), 3);
    }
}
