use crate::docstore::DocumentId;
use crate::error::{Error, Result};
use crate::index::InvertedIndex;
use crate::retry::{RetryJob, RetryQueue};

/// How a submission ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed,
    /// The batch failed; the job waits on the retry queue.
    RetryPending,
}

impl IndexOutcome {
    pub fn is_immediate(self) -> bool {
        self == IndexOutcome::Indexed
    }
}

/// Indexing front door: tries the index, falls back to the retry queue.
#[derive(Clone)]
pub struct IndexingPipeline {
    index: InvertedIndex,
    retry: RetryQueue,
}

impl IndexingPipeline {
    pub fn new(index: InvertedIndex, retry: RetryQueue) -> Self {
        Self { index, retry }
    }

    pub fn index(&self) -> &InvertedIndex {
        &self.index
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    pub async fn submit(&self, doc_id: &DocumentId, text: &str) -> Result<IndexOutcome> {
        let index_err = match self.index.add_document(doc_id, text).await {
            Ok(_) => return Ok(IndexOutcome::Indexed),
            Err(e) => e,
        };
        tracing::warn!(%doc_id, error = %index_err, "indexing failed, queueing for retry");

        match self.retry.push(&RetryJob::new(doc_id, text)).await {
            Ok(()) => Ok(IndexOutcome::RetryPending),
            Err(retry_err) => {
                tracing::error!(%doc_id, error = %retry_err, "retry enqueue failed");
                Err(Error::IndexingFailed { index: index_err, retry: retry_err })
            }
        }
    }
}
