//! Fault injection for exercising store-failure paths.

use super::{Command, KvStore, MemoryStore, Reply, Script, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;

/// Operation class a [`FaultyStore`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Atomic batches (`exec`).
    Exec,
    /// Scripts (`eval`).
    Eval,
    /// List pushes (`lpush`).
    Push,
}

/// [`MemoryStore`] wrapper that returns `StoreError::Unavailable` for the
/// operation classes currently injected.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Mutex<HashSet<Fault>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().insert(fault);
    }

    pub fn heal(&self) {
        self.faults.lock().clear();
    }

    fn check(&self, fault: Fault) -> StoreResult<()> {
        if self.faults.lock().contains(&fault) {
            return Err(StoreError::Unavailable(format!("injected {fault:?} fault")));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FaultyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.sismember(key, member).await
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.inner.zscore(key, member).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.inner.zcard(key).await
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: usize,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.inner.zrevrange_with_scores(key, start, limit).await
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        self.inner.zincrby(key, member, delta).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        self.inner.zadd(key, member, score).await
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.check(Fault::Push)?;
        self.inner.lpush(key, value).await
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        self.inner.llen(key).await
    }

    async fn lrange(&self, key: &str, start: usize, limit: Option<usize>) -> StoreResult<Vec<String>> {
        self.inner.lrange(key, start, limit).await
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        self.inner.brpop(key, timeout).await
    }

    async fn exec(&self, batch: &[Command]) -> StoreResult<Vec<Reply>> {
        self.check(Fault::Exec)?;
        self.inner.exec(batch).await
    }

    async fn eval(&self, script: &dyn Script) -> StoreResult<Reply> {
        self.check(Fault::Eval)?;
        self.inner.eval(script).await
    }
}
