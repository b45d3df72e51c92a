//! The operations the transport layer calls, wired over one shared store.

use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::docstore::{Document, DocumentId, DocumentStore, NewDocument};
use crate::error::{Error, Result};
use crate::index::InvertedIndex;
use crate::pipeline::{IndexOutcome, IndexingPipeline};
use crate::ranking::Ranker;
use crate::ratelimit::{Admission, RateLimiter};
use crate::retry::RetryQueue;
use crate::store::{KvStore, StoreResult};
use crate::tokenizer::Tokenizer;
use crate::trending::{TrendingDocument, TrendingEngine};
use crate::typeahead::Typeahead;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedDocument {
    pub id: DocumentId,
    /// False when indexing was deferred to the retry queue.
    pub indexed_immediately: bool,
}

#[derive(Clone)]
pub struct SearchService {
    docs: Arc<dyn DocumentStore>,
    pipeline: IndexingPipeline,
    ranker: Ranker,
    trending: TrendingEngine,
    typeahead: Typeahead,
    limiter: RateLimiter,
    config: ServiceConfig,
}

impl SearchService {
    pub fn new(
        store: Arc<dyn KvStore>,
        docs: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        tokenizer: Tokenizer,
        config: ServiceConfig,
    ) -> Self {
        let index = InvertedIndex::new(store.clone(), tokenizer);
        let typeahead = Typeahead::new(store.clone(), config.typeahead.clone());
        let pipeline = IndexingPipeline::new(
            index.clone(),
            RetryQueue::new(store.clone(), config.retry.clone()),
        );
        let ranker = Ranker::new(index, typeahead.clone(), config.page_size);
        let trending = TrendingEngine::new(
            store.clone(),
            docs.clone(),
            clock.clone(),
            config.trending.clone(),
        );
        let limiter = RateLimiter::new(store, clock, config.rate_limit.clone());
        Self { docs, pipeline, ranker, trending, typeahead, limiter, config }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &IndexingPipeline {
        &self.pipeline
    }

    pub fn trending_engine(&self) -> &TrendingEngine {
        &self.trending
    }

    pub fn typeahead(&self) -> &Typeahead {
        &self.typeahead
    }

    /// Stores the document, then indexes its content or parks it for retry.
    pub async fn add_document(&self, doc: NewDocument) -> Result<AddedDocument> {
        let mut missing = Vec::new();
        if doc.title.trim().is_empty() {
            missing.push("title");
        }
        if doc.content.trim().is_empty() {
            missing.push("content");
        }
        if !missing.is_empty() {
            return Err(Error::MissingFields(missing));
        }

        let stored = self.docs.insert(doc).await?;
        let outcome = self.pipeline.submit(&stored.id, &stored.content).await?;
        tracing::info!(id = %stored.id, ?outcome, "document added");
        Ok(AddedDocument { id: stored.id, indexed_immediately: outcome == IndexOutcome::Indexed })
    }

    /// One page of matching documents, best first. Pages start at 1; anything
    /// lower is treated as the first page. A page past any addressable offset
    /// is empty.
    pub async fn search(&self, query: &str, page: i64) -> Result<Vec<Document>> {
        let skipped = usize::try_from(page.max(1) - 1).unwrap_or(usize::MAX);
        let Some(offset) = self.ranker.page_size().checked_mul(skipped) else {
            tracing::debug!(page, "page beyond addressable range");
            return Ok(Vec::new());
        };
        let ranked = self.ranker.search(query, offset).await?;

        let mut results = Vec::with_capacity(ranked.len());
        for hit in ranked {
            let Ok(id) = hit.doc_id.parse::<DocumentId>() else {
                tracing::debug!(doc_id = %hit.doc_id, "skipping unparseable posting");
                continue;
            };
            match self.docs.get(&id).await {
                Ok(Some(doc)) => results.push(doc),
                Ok(None) => tracing::debug!(%id, "ranked document missing from store"),
                Err(e) => tracing::warn!(%id, error = %e, "document fetch failed"),
            }
        }
        Ok(results)
    }

    /// Number of documents in the system of record.
    pub async fn document_count(&self) -> Result<usize> {
        self.docs.count().await
    }

    /// Fetches a document and counts the view towards trending.
    pub async fn get_document(&self, raw_id: &str) -> Result<Document> {
        let id: DocumentId = raw_id.parse()?;
        let doc = self.docs.get(&id).await?.ok_or(Error::DocumentNotFound(id))?;
        if let Err(e) = self.trending.record_view(&id).await {
            tracing::warn!(%id, error = %e, "failed to record view");
        }
        Ok(doc)
    }

    /// Top documents of the current window. `None` uses the configured default.
    pub async fn trending(&self, limit: Option<usize>) -> Result<Vec<TrendingDocument>> {
        let limit = limit.unwrap_or(self.config.trending.default_limit);
        Ok(self.trending.trending(limit).await?)
    }

    pub async fn suggestions(&self, prefix: &str, limit: Option<usize>) -> StoreResult<Vec<String>> {
        let limit = limit.unwrap_or(self.config.typeahead.default_limit);
        self.typeahead.suggestions(prefix, limit).await
    }

    pub async fn add_term(&self, term: &str, score: f64) -> StoreResult<bool> {
        self.typeahead.add_term(term, score).await
    }

    /// Answers one raw typeahead channel message.
    pub async fn respond_typeahead(&self, raw: &str) -> Option<String> {
        self.typeahead.respond(raw).await
    }

    pub async fn admit(&self, client: &str) -> Admission {
        self.limiter.admit(client).await
    }
}
