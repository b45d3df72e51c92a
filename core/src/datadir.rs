//! A node's on-disk state: one sled database holding the document records
//! and the keyspace the engines run on, so both survive a restart together.

use crate::docstore::SledDocumentStore;
use crate::error::Result;
use crate::store::MemoryStore;
use std::path::Path;
use std::sync::Arc;

pub struct DataDir {
    db: sled::Db,
    documents: Arc<SledDocumentStore>,
    keyspace: Arc<MemoryStore>,
}

impl DataDir {
    const KEYSPACE_TREE: &'static str = "keyspace";

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let documents = Arc::new(SledDocumentStore::from_db(&db)?);
        let keyspace = Arc::new(MemoryStore::persistent(db.open_tree(Self::KEYSPACE_TREE)?)?);
        tracing::info!(path = %path.as_ref().display(), "data directory opened");
        Ok(Self { db, documents, keyspace })
    }

    pub fn documents(&self) -> Arc<SledDocumentStore> {
        self.documents.clone()
    }

    pub fn keyspace(&self) -> Arc<MemoryStore> {
        self.keyspace.clone()
    }

    /// Forces everything written so far to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
