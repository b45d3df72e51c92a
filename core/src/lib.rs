//! Real-time search over a shared key-value store: TF-IDF ranking, trending
//! documents, typeahead suggestions, rate limiting and indexing retries.

pub mod clock;
pub mod config;
pub mod datadir;
pub mod docstore;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod ranking;
pub mod ratelimit;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tokenizer;
pub mod trending;
pub mod typeahead;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FailurePolicy, ServiceConfig};
pub use datadir::DataDir;
pub use docstore::{Document, DocumentId, DocumentStore, NewDocument, SledDocumentStore};
pub use error::{Error, Result, StoreError};
pub use ratelimit::Admission;
pub use scheduler::BackgroundTasks;
pub use service::{AddedDocument, SearchService};
pub use store::{KvStore, MemoryStore};
pub use tokenizer::{StopWords, Tokenizer};
