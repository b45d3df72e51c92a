//! Sliding-window popularity.
//!
//! A view bumps the document in `trending_docs` and is also recorded in the
//! bucket of the UTC minute it happened in. Once a minute the bucket that has
//! left the window is replayed in reverse, so a score is the number of views
//! in the last `window_minutes` complete minutes.
//!
//! `trending:decay:cursor` holds the last minute decayed. Buckets at or behind
//! it are never decayed again, which makes ticks idempotent and lets a tick
//! that follows a pause catch up on every bucket it missed.

use crate::clock::Clock;
use crate::config::TrendingConfig;
use crate::docstore::{DocumentId, DocumentStore};
use crate::error::StoreError;
use crate::store::{Command, KvStore, Reply, Script, StoreResult, Transaction};
use serde::Serialize;
use std::sync::Arc;
use time::{OffsetDateTime, UtcOffset};

pub const TRENDING_KEY: &str = "trending_docs";
pub const DECAY_CURSOR_KEY: &str = "trending:decay:cursor";

/// Minutes since the Unix epoch.
pub fn minute_of(at: OffsetDateTime) -> i64 {
    at.unix_timestamp().div_euclid(60)
}

/// `YYYYMMDDHHMM` label of the UTC minute `minute`.
pub fn bucket_label(minute: i64) -> String {
    let at = (OffsetDateTime::UNIX_EPOCH + time::Duration::minutes(minute)).to_offset(UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}{:02}{:02}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute()
    )
}

pub fn seen_key(label: &str) -> String {
    format!("doc:views:{label}:docs")
}

pub fn view_counter_key(doc_id: &str, label: &str) -> String {
    format!("doc:{doc_id}:views:{label}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendingDocument {
    pub id: String,
    pub title: String,
    pub views: i64,
}

/// Work done by one decay tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub buckets: usize,
    pub documents: usize,
}

fn parse_counter(key: &str, raw: Option<String>) -> StoreResult<i64> {
    match raw {
        Some(raw) => raw.parse().map_err(|_| StoreError::NotANumber { key: key.to_string() }),
        None => Ok(0),
    }
}

/// Retires one minute bucket and advances the cursor past it.
struct DecayBucket {
    minute: i64,
    label: String,
}

impl Script for DecayBucket {
    fn name(&self) -> &'static str {
        "trending_decay_bucket"
    }

    fn run(&self, tx: &mut dyn Transaction) -> StoreResult<Reply> {
        if let Some(cursor) = tx.get(DECAY_CURSOR_KEY)? {
            let cursor = parse_counter(DECAY_CURSOR_KEY, Some(cursor))?;
            if self.minute <= cursor {
                return Ok(Reply::Nil);
            }
        }

        let seen = seen_key(&self.label);
        let docs = tx.smembers(&seen)?;
        for doc in &docs {
            let counter = view_counter_key(doc, &self.label);
            let count = parse_counter(&counter, tx.get(&counter)?)?;
            if count > 0 {
                let remaining = tx.zincrby(TRENDING_KEY, doc, -(count as f64))?;
                if remaining <= 0.0 {
                    tx.zrem(TRENDING_KEY, doc)?;
                }
            }
            tx.del(&counter)?;
        }
        tx.del(&seen)?;
        tx.set(DECAY_CURSOR_KEY, &self.minute.to_string())?;
        Ok(Reply::Int(docs.len() as i64))
    }
}

#[derive(Clone)]
pub struct TrendingEngine {
    store: Arc<dyn KvStore>,
    docs: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: TrendingConfig,
}

impl TrendingEngine {
    pub fn new(
        store: Arc<dyn KvStore>,
        docs: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: TrendingConfig,
    ) -> Self {
        Self { store, docs, clock, config }
    }

    pub fn config(&self) -> &TrendingConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn record_view(&self, doc_id: &DocumentId) -> StoreResult<()> {
        let id = doc_id.to_string();
        let label = bucket_label(minute_of(self.clock.now()));
        self.store
            .exec(&[
                Command::zincrby(TRENDING_KEY, id.as_str(), 1.0),
                Command::incr(view_counter_key(&id, &label)),
                Command::sadd(seen_key(&label), id.as_str()),
            ])
            .await?;
        Ok(())
    }

    /// Decays every bucket that has left the window and not been decayed yet.
    pub async fn decay_tick(&self) -> StoreResult<TickReport> {
        let target = minute_of(self.clock.now()) - self.config.window_minutes;
        let floor = target - self.config.max_catch_up_minutes + 1;
        let first = match self.cursor().await? {
            Some(cursor) => (cursor + 1).max(floor),
            None => floor,
        };

        let mut report = TickReport::default();
        for minute in first..=target {
            let script = DecayBucket { minute, label: bucket_label(minute) };
            if let Reply::Int(documents) = self.store.eval(&script).await? {
                report.buckets += 1;
                report.documents += documents as usize;
            }
        }
        if report.documents > 0 {
            tracing::debug!(buckets = report.buckets, documents = report.documents, "trending window slid");
        }
        Ok(report)
    }

    pub async fn cursor(&self) -> StoreResult<Option<i64>> {
        match self.store.get(DECAY_CURSOR_KEY).await? {
            Some(raw) => parse_counter(DECAY_CURSOR_KEY, Some(raw)).map(Some),
            None => Ok(None),
        }
    }

    pub async fn score(&self, doc_id: &DocumentId) -> StoreResult<f64> {
        Ok(self
            .store
            .zscore(TRENDING_KEY, &doc_id.to_string())
            .await?
            .unwrap_or(0.0))
    }

    /// Raw `(doc id, score)` pairs, highest first.
    pub async fn top(&self, limit: usize) -> StoreResult<Vec<(String, f64)>> {
        self.store.zrevrange_with_scores(TRENDING_KEY, 0, Some(limit)).await
    }

    /// Top documents with their titles. Documents whose title can't be
    /// looked up are left out.
    pub async fn trending(&self, limit: usize) -> StoreResult<Vec<TrendingDocument>> {
        let mut out = Vec::new();
        for (id, score) in self.top(limit).await? {
            let Ok(doc_id) = id.parse::<DocumentId>() else {
                continue;
            };
            match self.docs.title(&doc_id).await {
                Ok(Some(title)) => out.push(TrendingDocument { id, title, views: score.round() as i64 }),
                Ok(None) => tracing::debug!(%id, "trending document has no title"),
                Err(e) => tracing::debug!(%id, error = %e, "trending title lookup failed"),
            }
        }
        Ok(out)
    }
}
