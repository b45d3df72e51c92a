//! Key-value store seam.
//!
//! Every engine keeps its state in one shared store shaped like Redis:
//! counters, sets, hashes, sorted sets and lists. Multi-key mutations go
//! through [`KvStore::exec`] (all-or-nothing batch) or [`KvStore::eval`]
//! (a script with exclusive access to the keyspace), never through a
//! sequence of independent calls.

mod memory;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use memory::MemoryStore;

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Reply of a single command or script.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Float(f64),
}

impl Reply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Write command usable inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Incr { key: String },
    Del { key: String },
    SAdd { key: String, member: String },
    ZAdd { key: String, member: String, score: f64 },
    ZIncrBy { key: String, member: String, delta: f64 },
    LPush { key: String, value: String },
}

impl Command {
    pub fn incr(key: impl Into<String>) -> Self {
        Command::Incr { key: key.into() }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Command::Del { key: key.into() }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        Command::SAdd { key: key.into(), member: member.into() }
    }

    pub fn zadd(key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        Command::ZAdd { key: key.into(), member: member.into(), score }
    }

    pub fn zincrby(key: impl Into<String>, member: impl Into<String>, delta: f64) -> Self {
        Command::ZIncrBy { key: key.into(), member: member.into(), delta }
    }

    pub fn lpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::LPush { key: key.into(), value: value.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Incr { key }
            | Command::Del { key }
            | Command::SAdd { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZIncrBy { key, .. }
            | Command::LPush { key, .. } => key,
        }
    }

    pub fn apply(&self, tx: &mut dyn Transaction) -> StoreResult<Reply> {
        match self {
            Command::Incr { key } => tx.incr_by(key, 1).map(Reply::Int),
            Command::Del { key } => tx.del(key).map(|gone| Reply::Int(gone as i64)),
            Command::SAdd { key, member } => tx.sadd(key, member).map(|new| Reply::Int(new as i64)),
            Command::ZAdd { key, member, score } => {
                tx.zadd(key, member, *score).map(|new| Reply::Int(new as i64))
            }
            Command::ZIncrBy { key, member, delta } => tx.zincrby(key, member, *delta).map(Reply::Float),
            Command::LPush { key, value } => tx.lpush(key, value).map(|len| Reply::Int(len as i64)),
        }
    }
}

/// Synchronous view of the keyspace handed to scripts and batches.
///
/// Sorted-set ranges follow `ZREVRANGE`: descending score, ties by member
/// descending. `limit = None` reads to the end.
pub trait Transaction {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> StoreResult<()>;
    fn incr_by(&mut self, key: &str, delta: i64) -> StoreResult<i64>;
    fn del(&mut self, key: &str) -> StoreResult<bool>;
    /// Drops `key` once `ttl` has passed. False when the key does not exist.
    /// Writing the key with `set` or `del` clears the deadline.
    fn expire(&mut self, key: &str, ttl: Duration) -> StoreResult<bool>;

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    fn hset(&mut self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    fn sadd(&mut self, key: &str, member: &str) -> StoreResult<bool>;
    fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;
    fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    fn zadd(&mut self, key: &str, member: &str, score: f64) -> StoreResult<bool>;
    fn zincrby(&mut self, key: &str, member: &str, delta: f64) -> StoreResult<f64>;
    fn zrem(&mut self, key: &str, member: &str) -> StoreResult<bool>;
    fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;
    fn zcard(&self, key: &str) -> StoreResult<usize>;
    fn zrevrange(&self, key: &str, start: usize, limit: Option<usize>) -> StoreResult<Vec<(String, f64)>>;

    fn lpush(&mut self, key: &str, value: &str) -> StoreResult<usize>;
    fn rpop(&mut self, key: &str) -> StoreResult<Option<String>>;
    fn llen(&self, key: &str) -> StoreResult<usize>;
    fn lrange(&self, key: &str, start: usize, limit: Option<usize>) -> StoreResult<Vec<String>>;
}

/// Server-side script: runs with exclusive access to the keyspace, so its
/// read-compute-write sequence cannot interleave with other clients.
pub trait Script: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, tx: &mut dyn Transaction) -> StoreResult<Reply>;
}

/// The shared external store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;
    async fn zcard(&self, key: &str) -> StoreResult<usize>;
    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: usize,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>>;
    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64>;
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool>;
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<usize>;
    async fn llen(&self, key: &str) -> StoreResult<usize>;
    async fn lrange(&self, key: &str, start: usize, limit: Option<usize>) -> StoreResult<Vec<String>>;

    /// Pops from the tail of a list, waiting up to `timeout` for a value.
    async fn brpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>>;

    /// Applies the batch atomically: either every command takes effect or none does.
    async fn exec(&self, batch: &[Command]) -> StoreResult<Vec<Reply>>;

    async fn eval(&self, script: &dyn Script) -> StoreResult<Reply>;
}
