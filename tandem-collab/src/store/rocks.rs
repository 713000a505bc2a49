//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: document content (LZ4 compressed), keyed by document id
//! - `metadata`: bincode-encoded [`DocumentMetadata`], same key
//!
//! Content and metadata are always written together in one batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{Document, Store, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Block cache shared by both column families (32MB).
const BLOCK_CACHE_SIZE: usize = 32 * 1024 * 1024;

/// Metadata stored alongside every document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    /// Uncompressed content size in bytes
    pub size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(id: &str) -> Self {
        let now = unix_now();
        Self {
            id: id.to_string(),
            size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    path: PathBuf,
}

impl RocksStore {
    /// Open the store at `path`, creating the database and column families
    /// if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(BLOCK_CACHE_SIZE);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &path,
            cf_descriptors,
        )?;
        log::info!("Opened rocks store at {}", path.display());

        Ok(Self { db, path })
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Content is already LZ4 compressed before it reaches RocksDB.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(BLOCK_CACHE_SIZE as u64);

        opts
    }

    /// Load the metadata of a document.
    pub fn metadata(&self, id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// List every stored document id.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, doc: &Document, meta: &DocumentMetadata) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(doc.content.as_bytes());

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, doc.id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc.id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(false);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl Store for RocksStore {
    fn create(&self, doc: &Document) -> Result<(), StoreError> {
        if doc.id.is_empty() {
            return Err(StoreError::InvalidId(doc.id.clone()));
        }
        let cf_meta = self.cf(CF_METADATA)?;
        if self.db.get_cf(&cf_meta, doc.id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(doc.id.clone()));
        }

        let mut meta = DocumentMetadata::new(&doc.id);
        meta.size = doc.content.len() as u64;
        self.write(doc, &meta)
    }

    fn update(&self, doc: &Document) -> Result<(), StoreError> {
        if doc.id.is_empty() {
            return Err(StoreError::InvalidId(doc.id.clone()));
        }
        let mut meta = match self.metadata(&doc.id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(&doc.id),
            Err(e) => return Err(e),
        };
        meta.size = doc.content.len() as u64;
        meta.updated_at = unix_now();
        self.write(doc, &meta)
    }

    fn read(&self, id: &str) -> Result<Document, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(&cf, id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let content =
            String::from_utf8(bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Document {
            id: id.to_string(),
            content,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
