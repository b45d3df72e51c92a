//! TF-IDF ranking over the store-backed inverted index.
//!
//! Pagination is applied per term: page `p` of a query combines each term's
//! own postings `offset .. offset + page_size` (by descending frequency),
//! not ranks `offset ..` of the merged ranking. For single-term queries the
//! two agree; for multi-term queries later pages are approximate.

use crate::index::{InvertedIndex, Posting};
use crate::store::StoreResult;
use crate::typeahead::Typeahead;
use std::cmp::Ordering;
use std::collections::HashMap;

/// `ln(N / (1 + df))`. Negative once a term is in more than `N - 1` documents.
pub fn idf(total_docs: u64, document_frequency: usize) -> f64 {
    (total_docs as f64 / (1.0 + document_frequency as f64)).ln()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub doc_id: String,
    pub score: f64,
}

#[derive(Clone)]
pub struct Ranker {
    index: InvertedIndex,
    typeahead: Typeahead,
    page_size: usize,
}

struct TermStats {
    idf: f64,
    window: Vec<Posting>,
}

impl Ranker {
    pub fn new(index: InvertedIndex, typeahead: Typeahead, page_size: usize) -> Self {
        Self { index, typeahead, page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Ranks documents for `query`, reading each term's posting window at
    /// `offset`. Every query term also feeds the typeahead scores.
    pub async fn search(&self, query: &str, offset: usize) -> StoreResult<Vec<ScoredDocument>> {
        let terms = self.index.tokenizer().tokenize(query);
        tracing::debug!(?terms, offset, "search terms");
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let total_docs = self.index.total_documents().await?;
        let mut ranked = Vec::new();
        if total_docs > 0 {
            let mut stats: HashMap<&str, TermStats> = HashMap::new();
            for term in &terms {
                if stats.contains_key(term.as_str()) {
                    continue;
                }
                let df = self.index.document_frequency(term).await?;
                if df == 0 {
                    tracing::debug!(%term, "no postings for term");
                    continue;
                }
                let window = self.index.postings_window(term, offset, self.page_size).await?;
                stats.insert(term.as_str(), TermStats { idf: idf(total_docs, df), window });
            }

            // Repeated query terms score again.
            let mut scores: HashMap<&str, f64> = HashMap::new();
            for term in &terms {
                let Some(term_stats) = stats.get(term.as_str()) else { continue };
                for posting in &term_stats.window {
                    *scores.entry(posting.doc_id.as_str()).or_insert(0.0) +=
                        posting.term_frequency * term_stats.idf;
                }
            }

            ranked = scores
                .into_iter()
                .map(|(doc_id, score)| ScoredDocument { doc_id: doc_id.to_string(), score })
                .collect();
            ranked.sort_by(|a: &ScoredDocument, b: &ScoredDocument| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.doc_id.cmp(&b.doc_id))
            });
            ranked.truncate(self.page_size);
        }

        for term in &terms {
            self.typeahead.increment_term(term);
        }
        tracing::debug!(hits = ranked.len(), "ranked documents");
        Ok(ranked)
    }
}
