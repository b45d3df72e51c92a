//! Leaky-bucket admission control, one bucket per client key.
//!
//! Bucket state is the hash `rl:ip:{client}` with fields `tokens` and `last`
//! (unix seconds). The refill-and-take step runs as a single store script so
//! concurrent requests from one client are linearized. A bucket left alone
//! for `capacity / refill_rate` seconds is full again, so it expires then.

use crate::clock::Clock;
use crate::config::{FailurePolicy, RateLimitConfig};
use crate::error::StoreError;
use crate::store::{KvStore, Reply, Script, StoreResult, Transaction};
use std::sync::Arc;
use std::time::Duration;

pub fn bucket_key(client: &str) -> String {
    format!("rl:ip:{client}")
}

/// Verdict of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
    /// The limiter could not reach its store and the policy is fail-closed.
    Unavailable,
}

struct LeakyBucket<'a> {
    key: &'a str,
    now: f64,
    capacity: f64,
    refill_rate: f64,
}

fn field(tx: &dyn Transaction, key: &str, name: &str) -> StoreResult<Option<f64>> {
    match tx.hget(key, name)? {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| StoreError::NotANumber { key: format!("{key}.{name}") }),
        None => Ok(None),
    }
}

impl LeakyBucket<'_> {
    fn idle_ttl(&self) -> Option<Duration> {
        if self.refill_rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64((self.capacity / self.refill_rate).ceil()).ok()
    }
}

impl Script for LeakyBucket<'_> {
    fn name(&self) -> &'static str {
        "leaky_bucket"
    }

    fn run(&self, tx: &mut dyn Transaction) -> StoreResult<Reply> {
        let tokens = field(tx, self.key, "tokens")?.unwrap_or(self.capacity);
        let last = field(tx, self.key, "last")?.unwrap_or(self.now);

        let elapsed = (self.now - last).max(0.0);
        let mut tokens = (tokens + elapsed * self.refill_rate).min(self.capacity);
        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }

        tx.hset(self.key, "tokens", &tokens.to_string())?;
        tx.hset(self.key, "last", &self.now.to_string())?;
        if let Some(idle) = self.idle_ttl() {
            tx.expire(self.key, idle)?;
        }
        Ok(Reply::Int(allowed as i64))
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Takes one token from `client`'s bucket if one is available.
    pub async fn allow(&self, client: &str) -> StoreResult<bool> {
        let key = bucket_key(client);
        let script = LeakyBucket {
            key: &key,
            now: self.clock.unix_seconds(),
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
        };
        let reply = self.store.eval(&script).await?;
        Ok(reply.as_int() == Some(1))
    }

    /// [`allow`](Self::allow) with the configured failure policy applied.
    pub async fn admit(&self, client: &str) -> Admission {
        match self.allow(client).await {
            Ok(true) => Admission::Allowed,
            Ok(false) => {
                tracing::debug!(%client, "rate limit exceeded");
                Admission::Denied
            }
            Err(e) => match self.config.failure_policy {
                FailurePolicy::FailOpen => {
                    tracing::warn!(%client, error = %e, "rate limiter unavailable, admitting");
                    Admission::Allowed
                }
                FailurePolicy::FailClosed => {
                    tracing::error!(%client, error = %e, "rate limiter failed");
                    Admission::Unavailable
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::{Fault, FaultyStore};
    use crate::store::MemoryStore;
    use std::time::Duration;
    use time::macros::datetime;

    fn limiter(store: Arc<dyn KvStore>, policy: FailurePolicy) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00:00 UTC)));
        let config = RateLimitConfig { capacity: 5.0, refill_rate: 0.5, failure_policy: policy };
        (RateLimiter::new(store, clock.clone(), config), clock)
    }

    #[tokio::test]
    async fn burst_then_refill() {
        let (rl, clock) = limiter(Arc::new(MemoryStore::new()), FailurePolicy::FailClosed);
        for i in 0..5 {
            assert!(rl.allow("10.0.0.1").await.unwrap(), "request {i} should pass");
        }
        assert!(!rl.allow("10.0.0.1").await.unwrap());

        clock.advance(Duration::from_secs(2));
        assert!(rl.allow("10.0.0.1").await.unwrap());
        assert!(!rl.allow("10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn clients_have_separate_buckets() {
        let (rl, _) = limiter(Arc::new(MemoryStore::new()), FailurePolicy::FailClosed);
        for _ in 0..5 {
            rl.allow("a").await.unwrap();
        }
        assert!(!rl.allow("a").await.unwrap());
        assert!(rl.allow("b").await.unwrap());
    }

    #[tokio::test]
    async fn denied_requests_keep_their_tokens() {
        let (rl, clock) = limiter(Arc::new(MemoryStore::new()), FailurePolicy::FailClosed);
        for _ in 0..5 {
            rl.allow("c").await.unwrap();
        }
        // half a token accrues, denials must not eat it
        clock.advance(Duration::from_secs(1));
        assert!(!rl.allow("c").await.unwrap());
        assert!(!rl.allow("c").await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(rl.allow("c").await.unwrap());
    }

    #[tokio::test]
    async fn refill_is_capped_at_capacity() {
        let (rl, clock) = limiter(Arc::new(MemoryStore::new()), FailurePolicy::FailClosed);
        rl.allow("d").await.unwrap();
        clock.advance(Duration::from_secs(3600));
        let passed = {
            let mut n = 0;
            for _ in 0..10 {
                if rl.allow("d").await.unwrap() {
                    n += 1;
                }
            }
            n
        };
        assert_eq!(passed, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_bucket() {
        let (rl, _) = limiter(Arc::new(MemoryStore::new()), FailurePolicy::FailClosed);
        let requests: Vec<_> = (0..20)
            .map(|_| {
                let rl = rl.clone();
                tokio::spawn(async move { rl.allow("203.0.113.9").await })
            })
            .collect();
        let mut passed = 0;
        for request in requests {
            if request.await.unwrap().unwrap() {
                passed += 1;
            }
        }
        assert_eq!(passed, 5);
    }

    #[tokio::test]
    async fn idle_buckets_expire() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00:00 UTC)));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = RateLimitConfig { capacity: 5.0, refill_rate: 0.5, ..RateLimitConfig::default() };
        let rl = RateLimiter::new(store.clone(), clock.clone(), config);

        for client in ["198.51.100.1", "198.51.100.2", "198.51.100.3"] {
            rl.allow(client).await.unwrap();
        }
        assert_eq!(store.key_count().unwrap(), 3);

        // a request refreshes its own bucket's deadline
        clock.advance(Duration::from_secs(6));
        rl.allow("198.51.100.1").await.unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.key_count().unwrap(), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.key_count().unwrap(), 0);
        for _ in 0..5 {
            assert!(rl.allow("198.51.100.1").await.unwrap());
        }
    }

    #[tokio::test]
    async fn buckets_without_refill_never_expire() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00:00 UTC)));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = RateLimitConfig { capacity: 1.0, refill_rate: 0.0, ..RateLimitConfig::default() };
        let rl = RateLimiter::new(store.clone(), clock.clone(), config);

        assert!(rl.allow("f").await.unwrap());
        clock.advance(Duration::from_secs(86_400));
        assert!(!rl.allow("f").await.unwrap());
    }

    #[tokio::test]
    async fn failure_policy_decides_admission() {
        let store = Arc::new(FaultyStore::new());
        store.inject(Fault::Eval);

        let (closed, _) = limiter(store.clone(), FailurePolicy::FailClosed);
        assert_eq!(closed.admit("e").await, Admission::Unavailable);

        let (open, _) = limiter(store.clone(), FailurePolicy::FailOpen);
        assert_eq!(open.admit("e").await, Admission::Allowed);

        store.heal();
        assert_eq!(closed.admit("e").await, Admission::Allowed);
    }
}
