//! Document system of record.
//!
//! The engines only ever see document ids; titles and bodies live here.
//! `SledDocumentStore` keeps bincode-encoded records in a sled tree.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque, globally unique document id. Rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for DocumentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::InvalidDocumentId(s.to_string()))
    }
}

impl TryFrom<String> for DocumentId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Submission payload; the store assigns id and creation time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, doc: NewDocument) -> Result<Document>;
    async fn get(&self, id: &DocumentId) -> Result<Option<Document>>;
    async fn count(&self) -> Result<usize>;

    async fn title(&self, id: &DocumentId) -> Result<Option<String>> {
        Ok(self.get(id).await?.map(|d| d.title))
    }
}

/// sled-backed store. sled calls can touch disk, so they run on tokio's
/// blocking pool rather than on the request task.
pub struct SledDocumentStore {
    tree: sled::Tree,
}

impl SledDocumentStore {
    const TREE: &'static str = "documents";

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_db(&sled::open(path)?)
    }

    /// Store in the `documents` tree of an already opened database.
    pub fn from_db(db: &sled::Db) -> Result<Self> {
        Ok(Self { tree: db.open_tree(Self::TREE)? })
    }

    /// Store backed by a throwaway directory, removed on drop.
    pub fn temporary() -> Result<Self> {
        Self::from_db(&sled::Config::new().temporary(true).open()?)
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(sled::Tree) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tree = self.tree.clone();
        tokio::task::spawn_blocking(move || f(tree))
            .await
            .map_err(|e| Error::DocumentStore(format!("document store task failed: {e}")))?
    }
}

#[async_trait]
impl DocumentStore for SledDocumentStore {
    async fn insert(&self, doc: NewDocument) -> Result<Document> {
        let document = Document {
            id: DocumentId::new(),
            title: doc.title,
            content: doc.content,
            tags: doc.tags,
            created_at: OffsetDateTime::now_utc(),
        };
        let bytes = bincode::serialize(&document)?;
        let key = *document.id.0.as_bytes();
        self.blocking(move |tree| {
            tree.insert(key, bytes)?;
            Ok(())
        })
        .await?;
        tracing::debug!(id = %document.id, "document stored");
        Ok(document)
    }

    async fn get(&self, id: &DocumentId) -> Result<Option<Document>> {
        let key = *id.0.as_bytes();
        let bytes = self.blocking(move |tree| Ok(tree.get(key)?)).await?;
        match bytes {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn count(&self) -> Result<usize> {
        self.blocking(|tree| Ok(tree.len())).await
    }
}
