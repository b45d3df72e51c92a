//! Prefix suggestions ranked by how often terms are searched.
//!
//! Scores live in the `typeahead` sorted set. Lookups scan the whole set in
//! score order and filter by prefix, which is fine at the cardinalities this
//! service sees but grows linearly with the vocabulary.

use crate::config::TypeaheadConfig;
use crate::store::{KvStore, StoreResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TYPEAHEAD_KEY: &str = "typeahead";

/// Inbound channel message.
#[derive(Debug, Clone, Deserialize)]
pub struct SuggestionRequest {
    pub prefix: String,
    #[serde(default)]
    pub limit: i64,
}

/// Outbound channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionResponse {
    pub suggestions: Vec<String>,
}

#[derive(Clone)]
pub struct Typeahead {
    store: Arc<dyn KvStore>,
    config: TypeaheadConfig,
}

impl Typeahead {
    pub fn new(store: Arc<dyn KvStore>, config: TypeaheadConfig) -> Self {
        Self { store, config }
    }

    fn accepts(&self, term: &str) -> bool {
        let len = term.chars().count();
        len >= self.config.min_len && len <= self.config.max_len
    }

    /// Up to `k` terms starting with `prefix` (case-insensitive), best first.
    /// Prefixes outside the length bounds get no suggestions.
    pub async fn suggestions(&self, prefix: &str, k: usize) -> StoreResult<Vec<String>> {
        if !self.accepts(prefix) || k == 0 {
            return Ok(Vec::new());
        }
        let needle = prefix.to_lowercase();
        let ranked = self.store.zrevrange_with_scores(TYPEAHEAD_KEY, 0, None).await?;
        Ok(ranked
            .into_iter()
            .map(|(term, _)| term)
            .filter(|term| term.to_lowercase().starts_with(&needle))
            .take(k)
            .collect())
    }

    /// Awaited increment; no-op for terms outside the length bounds.
    pub async fn bump(&self, term: &str) -> StoreResult<()> {
        if !self.accepts(term) {
            return Ok(());
        }
        self.store.zincrby(TYPEAHEAD_KEY, term, 1.0).await?;
        Ok(())
    }

    /// Fire-and-forget increment. Must be called from within a tokio runtime.
    pub fn increment_term(&self, term: &str) {
        if !self.accepts(term) {
            return;
        }
        let engine = self.clone();
        let term = term.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.bump(&term).await {
                tracing::debug!(%term, error = %e, "typeahead increment failed");
            }
        });
    }

    /// Seeds or overwrites a term's score.
    pub async fn add_term(&self, term: &str, score: f64) -> StoreResult<bool> {
        if !self.accepts(term) {
            return Ok(false);
        }
        self.store.zadd(TYPEAHEAD_KEY, term, score).await?;
        Ok(true)
    }

    pub async fn score(&self, term: &str) -> StoreResult<Option<f64>> {
        self.store.zscore(TYPEAHEAD_KEY, term).await
    }

    /// Handles one channel message. Malformed messages and store failures
    /// yield `None` (nothing is sent back). A non-empty answer reinforces its
    /// top suggestion in the background.
    pub async fn respond(&self, raw: &str) -> Option<String> {
        let request: SuggestionRequest = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed typeahead message");
                return None;
            }
        };
        let limit = if request.limit <= 0 {
            self.config.default_limit
        } else {
            request.limit as usize
        };

        let suggestions = match self.suggestions(&request.prefix, limit).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(prefix = %request.prefix, error = %e, "typeahead lookup failed");
                return None;
            }
        };
        if let Some(top) = suggestions.first() {
            self.increment_term(top);
        }
        serde_json::to_string(&SuggestionResponse { suggestions }).ok()
    }
}
