//! Error types shared by the engines.
//!
//! Store failures are kept apart from service-level failures so callers can
//! tell a transient key-value outage from a bad request.

use crate::docstore::DocumentId;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by a [`KvStore`](crate::store::KvStore) implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Operation against a key holding the wrong kind of value.
    #[error("WRONGTYPE operation against key {key} holding {found}")]
    WrongType { key: String, found: &'static str },

    /// Counter or hash field that does not parse as a number.
    #[error("value at {key} is not a number")]
    NotANumber { key: String },

    /// Store could not be reached or refused the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Indexing failed and the job could not be parked on the retry queue.
    #[error("indexing failed ({index}) and retry enqueue failed ({retry})")]
    IndexingFailed { index: StoreError, retry: StoreError },

    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),

    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("missing fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("document store error: {0}")]
    DocumentStore(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("failed to load stop words: {0}")]
    StopWords(#[from] io::Error),
}

impl Error {
    /// True when the caller sent something unusable rather than the service failing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidDocumentId(_) | Error::DocumentNotFound(_) | Error::MissingFields(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::DocumentStore(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_failure_mentions_both_causes() {
        let err = Error::IndexingFailed {
            index: StoreError::Unavailable("batch".into()),
            retry: StoreError::Unavailable("lpush".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch"));
        assert!(msg.contains("lpush"));
    }

    #[test]
    fn missing_fields_lists_names() {
        let err = Error::MissingFields(vec!["title", "content"]);
        assert_eq!(err.to_string(), "missing fields: title, content");
        assert!(err.is_client_error());
    }

    #[test]
    fn store_errors_are_server_faults() {
        let err: Error = StoreError::Unavailable("down".into()).into();
        assert!(!err.is_client_error());
    }
}
