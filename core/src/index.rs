//! Inverted index kept in the shared store.
//!
//! Each term owns a sorted set `index:{term}` mapping document id to term
//! frequency; its cardinality is the term's document frequency. The corpus
//! size lives in `meta:totalDocs` and only ever grows.

use crate::docstore::DocumentId;
use crate::error::StoreError;
use crate::store::{Command, KvStore, StoreResult};
use crate::tokenizer::Tokenizer;
use std::sync::Arc;

pub const TOTAL_DOCS_KEY: &str = "meta:totalDocs";
pub const INDEXED_DOCS_KEY: &str = "indexed_docs";

pub fn term_key(term: &str) -> String {
    format!("index:{term}")
}

/// One entry of a posting window.
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub doc_id: String,
    pub term_frequency: f64,
}

#[derive(Clone)]
pub struct InvertedIndex {
    store: Arc<dyn KvStore>,
    tokenizer: Tokenizer,
}

impl InvertedIndex {
    pub fn new(store: Arc<dyn KvStore>, tokenizer: Tokenizer) -> Self {
        Self { store, tokenizer }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Adds every token of `text` to the postings of `doc_id`, marks the
    /// document indexed and bumps the corpus size, all in one atomic batch.
    /// Returns the number of tokens indexed.
    pub async fn add_document(&self, doc_id: &DocumentId, text: &str) -> Result<usize, StoreError> {
        let id = doc_id.to_string();
        let tokens = self.tokenizer.tokenize(text);

        let mut batch: Vec<Command> = tokens
            .iter()
            .map(|term| Command::zincrby(term_key(term), id.as_str(), 1.0))
            .collect();
        batch.push(Command::sadd(INDEXED_DOCS_KEY, id.as_str()));
        batch.push(Command::incr(TOTAL_DOCS_KEY));

        self.store.exec(&batch).await?;
        tracing::debug!(doc_id = %id, tokens = tokens.len(), "document indexed");
        Ok(tokens.len())
    }

    /// Corpus size; zero before anything has been indexed.
    pub async fn total_documents(&self) -> StoreResult<u64> {
        match self.store.get(TOTAL_DOCS_KEY).await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::NotANumber { key: TOTAL_DOCS_KEY.to_string() }),
            None => Ok(0),
        }
    }

    pub async fn document_frequency(&self, term: &str) -> StoreResult<usize> {
        self.store.zcard(&term_key(term)).await
    }

    /// `len` postings of `term` starting at `offset`, highest frequency first.
    pub async fn postings_window(&self, term: &str, offset: usize, len: usize) -> StoreResult<Vec<Posting>> {
        let window = self
            .store
            .zrevrange_with_scores(&term_key(term), offset, Some(len))
            .await?;
        Ok(window
            .into_iter()
            .map(|(doc_id, term_frequency)| Posting { doc_id, term_frequency })
            .collect())
    }

    pub async fn term_frequency(&self, term: &str, doc_id: &DocumentId) -> StoreResult<Option<f64>> {
        self.store.zscore(&term_key(term), &doc_id.to_string()).await
    }

    pub async fn is_indexed(&self, doc_id: &DocumentId) -> StoreResult<bool> {
        self.store.sismember(INDEXED_DOCS_KEY, &doc_id.to_string()).await
    }
}
