//! Durable FIFO of indexing jobs that failed on first submission.
//!
//! Jobs are LPUSHed as JSON onto `retry:index_queue` and drained with a
//! bounded BRPOP. A job that fails again is put back after the drain (so it
//! gets at most one attempt per drain) until it has used `max_attempts`,
//! then it is moved to `retry:index_dead`.

use crate::config::RetryConfig;
use crate::docstore::DocumentId;
use crate::error::StoreError;
use crate::index::InvertedIndex;
use crate::store::{KvStore, StoreResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const RETRY_QUEUE_KEY: &str = "retry:index_queue";
pub const DEAD_LETTER_KEY: &str = "retry:index_dead";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryJob {
    #[serde(rename = "docID")]
    pub doc_id: String,
    pub text: String,
    #[serde(default)]
    pub attempts: u32,
}

impl RetryJob {
    pub fn new(doc_id: &DocumentId, text: &str) -> Self {
        Self { doc_id: doc_id.to_string(), text: text.to_string(), attempts: 0 }
    }
}

/// Outcome counts of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub indexed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub malformed: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        *self == DrainReport::default()
    }
}

#[derive(Clone)]
pub struct RetryQueue {
    store: Arc<dyn KvStore>,
    config: RetryConfig,
}

impl RetryQueue {
    pub fn new(store: Arc<dyn KvStore>, config: RetryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn push(&self, job: &RetryJob) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(job).map_err(|e| StoreError::Unavailable(format!("encode retry job: {e}")))?;
        self.store.lpush(RETRY_QUEUE_KEY, &payload).await?;
        Ok(())
    }

    pub async fn len(&self) -> StoreResult<usize> {
        self.store.llen(RETRY_QUEUE_KEY).await
    }

    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn dead_letters(&self) -> StoreResult<Vec<RetryJob>> {
        let raw = self.store.lrange(DEAD_LETTER_KEY, 0, None).await?;
        Ok(raw.iter().filter_map(|r| serde_json::from_str(r).ok()).collect())
    }

    /// Pops jobs until the queue stays empty for `pop_timeout`, re-indexing
    /// each. A store error while popping ends the drain early.
    pub async fn drain(&self, index: &InvertedIndex) -> StoreResult<DrainReport> {
        let mut report = DrainReport::default();
        let mut failed = Vec::new();

        loop {
            let raw = match self.store.brpop(RETRY_QUEUE_KEY, self.config.pop_timeout).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "retry queue pop failed");
                    self.settle(failed, &mut report).await;
                    return Err(e);
                }
            };

            let job: RetryJob = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed retry job");
                    report.malformed += 1;
                    continue;
                }
            };
            let doc_id = match job.doc_id.parse::<DocumentId>() {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!(doc_id = %job.doc_id, "dropping retry job with invalid id");
                    report.malformed += 1;
                    continue;
                }
            };

            match index.add_document(&doc_id, &job.text).await {
                Ok(_) => {
                    tracing::info!(doc_id = %job.doc_id, attempts = job.attempts + 1, "retry indexed document");
                    report.indexed += 1;
                }
                Err(e) => {
                    tracing::warn!(doc_id = %job.doc_id, error = %e, "retry failed for document");
                    failed.push(job);
                }
            }
        }

        self.settle(failed, &mut report).await;
        Ok(report)
    }

    async fn settle(&self, failed: Vec<RetryJob>, report: &mut DrainReport) {
        for mut job in failed {
            job.attempts += 1;
            let (key, requeue) = if job.attempts < self.config.max_attempts {
                (RETRY_QUEUE_KEY, true)
            } else {
                (DEAD_LETTER_KEY, false)
            };
            let payload = match serde_json::to_string(&job) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(doc_id = %job.doc_id, error = %e, "could not encode retry job");
                    continue;
                }
            };
            match self.store.lpush(key, &payload).await {
                Ok(_) if requeue => report.requeued += 1,
                Ok(_) => {
                    tracing::warn!(doc_id = %job.doc_id, attempts = job.attempts, "retry job dead-lettered");
                    report.dead_lettered += 1;
                }
                Err(e) => {
                    tracing::error!(doc_id = %job.doc_id, error = %e, "lost retry job");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{Fault, FaultyStore};
    use crate::store::MemoryStore;
    use crate::tokenizer::Tokenizer;
    use std::time::Duration;

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig { interval: Duration::from_millis(10), pop_timeout: Duration::from_millis(20), max_attempts }
    }

    #[test]
    fn job_wire_format_uses_doc_id_key() {
        let job: RetryJob = serde_json::from_str(r#"{"docID":"abc","text":"hello"}"#).unwrap();
        assert_eq!(job.doc_id, "abc");
        assert_eq!(job.attempts, 0);
        let encoded = serde_json::to_string(&job).unwrap();
        assert!(encoded.contains(r#""docID":"abc""#));
    }

    #[tokio::test]
    async fn drain_indexes_queued_jobs_in_order() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let queue = RetryQueue::new(store.clone(), quick(3));
        let index = InvertedIndex::new(store, Tokenizer::default());

        let first = DocumentId::new();
        let second = DocumentId::new();
        queue.push(&RetryJob::new(&first, "alpha")).await.unwrap();
        queue.push(&RetryJob::new(&second, "beta")).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        let report = queue.drain(&index).await.unwrap();
        assert_eq!(report.indexed, 2);
        assert!(queue.is_empty().await.unwrap());
        assert_eq!(index.total_documents().await.unwrap(), 2);
        assert_eq!(index.term_frequency("beta", &second).await.unwrap(), Some(1.0));
    }

    #[tokio::test]
    async fn malformed_jobs_are_skipped() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let queue = RetryQueue::new(store.clone(), quick(3));
        let index = InvertedIndex::new(store.clone(), Tokenizer::default());

        store.lpush(RETRY_QUEUE_KEY, "{not json").await.unwrap();
        store
            .lpush(RETRY_QUEUE_KEY, r#"{"docID":"zzz","text":"x"}"#)
            .await
            .unwrap();
        let report = queue.drain(&index).await.unwrap();
        assert_eq!(report.malformed, 2);
        assert_eq!(report.indexed, 0);
    }

    #[tokio::test]
    async fn failing_jobs_are_requeued_then_dead_lettered() {
        let store = Arc::new(FaultyStore::new());
        let queue = RetryQueue::new(store.clone(), quick(2));
        let index = InvertedIndex::new(store.clone(), Tokenizer::default());
        let doc = DocumentId::new();
        queue.push(&RetryJob::new(&doc, "stubborn")).await.unwrap();

        store.inject(Fault::Exec);
        let report = queue.drain(&index).await.unwrap();
        assert_eq!(report, DrainReport { requeued: 1, ..Default::default() });
        assert_eq!(queue.len().await.unwrap(), 1);

        let report = queue.drain(&index).await.unwrap();
        assert_eq!(report, DrainReport { dead_lettered: 1, ..Default::default() });
        assert!(queue.is_empty().await.unwrap());

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].doc_id, doc.to_string());
        assert_eq!(dead[0].attempts, 2);
    }

    #[tokio::test]
    async fn single_attempt_policy_drops_straight_to_dead_letters() {
        let store = Arc::new(FaultyStore::new());
        let queue = RetryQueue::new(store.clone(), quick(1));
        let index = InvertedIndex::new(store.clone(), Tokenizer::default());
        queue.push(&RetryJob::new(&DocumentId::new(), "once")).await.unwrap();

        store.inject(Fault::Exec);
        let report = queue.drain(&index).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.requeued, 0);
    }
}
