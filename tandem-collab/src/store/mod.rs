//! Document storage backends.
//!
//! ```text
//! ┌─────────────┐   read on open     ┌──────────────────────────┐
//! │ Binder      │ ─────────────────► │ dyn Store                │
//! │ (one per    │   update on flush  │  ├─ MemoryStore          │
//! │  document)  │ ─────────────────► │  ├─ FileStore  (dir)     │
//! └─────────────┘                    │  └─ RocksStore (RocksDB) │
//!                                    └──────────────────────────┘
//! ```
//!
//! While a document is open its binder is the only writer, so stores only
//! need single-writer-per-id semantics.

pub mod file;
pub mod memory;
pub mod rocks;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// A document at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub content: String,
}

impl Document {
    /// New document with a random UUID v4 id.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid document id: {0:?}")]
    InvalidId(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Read/write contract every backend implements.
pub trait Store: Send + Sync {
    /// Store a new document, failing if the id is taken.
    fn create(&self, doc: &Document) -> Result<(), StoreError>;

    /// Overwrite the content of a document.
    fn update(&self, doc: &Document) -> Result<(), StoreError>;

    fn read(&self, id: &str) -> Result<Document, StoreError>;
}

/// Which backend to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Memory,
    File,
    Rocks,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub store_type: StoreType,
    /// Root directory for the file and rocks backends (default: tandem_data)
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::Memory,
            path: PathBuf::from("tandem_data"),
        }
    }
}

impl StoreConfig {
    /// Open the configured backend.
    pub fn build(&self) -> Result<Arc<dyn Store>, StoreError> {
        let store: Arc<dyn Store> = match self.store_type {
            StoreType::Memory => Arc::new(MemoryStore::new()),
            StoreType::File => Arc::new(FileStore::open(&self.path)?),
            StoreType::Rocks => Arc::new(RocksStore::open(&self.path)?),
        };
        log::info!("Opened {:?} document store", self.store_type);
        Ok(store)
    }
}
