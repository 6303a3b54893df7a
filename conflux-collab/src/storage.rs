//! Durable storage behind the document cache.
//!
//! The engine only ever needs two calls: load a persisted document, save one
//! (an idempotent upsert, safe to repeat with monotonically advancing
//! state). [`DurableStore`] captures that contract; everything else about
//! durability is an adapter concern.
//!
//! Two implementations:
//! - [`MemoryStore`] — HashMap-backed, for tests and ephemeral servers.
//! - [`RocksStore`] — RocksDB with column families:
//!   - `documents` — current plain value (JSON)
//!   - `crdt`      — full CRDT state (JSON, LZ4 compressed)
//!   - `metadata`  — version + updated-at (JSON)
//!
//! Keys are `collection/doc_id`. Corrupt or unreadable state is reported as
//! [`StoreError::Corrupt`]; the coordinator turns that into "start a fresh
//! document" rather than failing the request.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use conflux_crdt::{unix_millis, DocumentState};

const CF_DOCUMENTS: &str = "documents";
const CF_CRDT: &str = "crdt";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CRDT, CF_METADATA];

/// What the store keeps per document.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedDocument {
    /// Current plain value (what `crdt_get` would return).
    pub data: Value,
    /// Full CRDT state, sufficient to reconstruct the document.
    pub crdt_state: DocumentState,
    /// Document version at save time.
    pub version: u64,
}

/// Storage errors.
#[derive(Debug)]
pub enum StoreError {
    Io(String),
    Corrupt(String),
    Unavailable,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Storage I/O error: {e}"),
            Self::Corrupt(e) => write!(f, "Corrupt stored state: {e}"),
            Self::Unavailable => write!(f, "Storage unavailable"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The two-call durability contract consumed by the sync engine.
pub trait DurableStore: Send + Sync {
    fn load(&self, collection: &str, doc_id: &str) -> Result<Option<PersistedDocument>, StoreError>;

    /// Idempotent upsert of current value + CRDT state.
    fn save(&self, collection: &str, doc_id: &str, doc: &PersistedDocument)
        -> Result<(), StoreError>;
}

fn storage_key(collection: &str, doc_id: &str) -> String {
    format!("{collection}/{doc_id}")
}

// ───────────────────────────────────────────────────────────────────
// In-memory store
// ───────────────────────────────────────────────────────────────────

/// HashMap-backed store for tests and storage-less servers.
///
/// `fail_writes` lets tests exercise the write-back failure path.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, PersistedDocument>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStore for MemoryStore {
    fn load(&self, collection: &str, doc_id: &str) -> Result<Option<PersistedDocument>, StoreError> {
        let docs = self.docs.read().map_err(|_| StoreError::Unavailable)?;
        Ok(docs.get(&storage_key(collection, doc_id)).cloned())
    }

    fn save(
        &self,
        collection: &str,
        doc_id: &str,
        doc: &PersistedDocument,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let mut docs = self.docs.write().map_err(|_| StoreError::Unavailable)?;
        docs.insert(storage_key(collection, doc_id), doc.clone());
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// RocksDB store
// ───────────────────────────────────────────────────────────────────

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: f64,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("conflux_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            max_open_files: 64,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DocMetadata {
    version: u64,
    updated_at: u64,
}

/// RocksDB-backed durable store.
pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
}

impl RocksStore {
    /// Open (or create) the database at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&Cache::new_lru_cache(config.block_cache_size));
        block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        opts.set_block_based_table_factory(&block_opts);

        let cfs: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, &config.path, cfs)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db.cf_handle(name).ok_or(StoreError::Unavailable)
    }
}

impl DurableStore for RocksStore {
    fn load(&self, collection: &str, doc_id: &str) -> Result<Option<PersistedDocument>, StoreError> {
        let key = storage_key(collection, doc_id);

        let crdt_bytes = match self
            .db
            .get_cf(&self.cf(CF_CRDT)?, key.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let crdt_json = lz4_flex::decompress_size_prepended(&crdt_bytes)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let crdt_state: DocumentState = serde_json::from_slice(&crdt_json)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let data = match self
            .db
            .get_cf(&self.cf(CF_DOCUMENTS)?, key.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?
            }
            None => Value::Object(serde_json::Map::new()),
        };

        let version = match self
            .db
            .get_cf(&self.cf(CF_METADATA)?, key.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            Some(bytes) => serde_json::from_slice::<DocMetadata>(&bytes)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?
                .version,
            None => crdt_state.version,
        };

        Ok(Some(PersistedDocument {
            data,
            crdt_state,
            version,
        }))
    }

    fn save(
        &self,
        collection: &str,
        doc_id: &str,
        doc: &PersistedDocument,
    ) -> Result<(), StoreError> {
        let key = storage_key(collection, doc_id);

        let data_json =
            serde_json::to_vec(&doc.data).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let crdt_json =
            serde_json::to_vec(&doc.crdt_state).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let crdt_compressed = lz4_flex::compress_prepend_size(&crdt_json);
        let meta = serde_json::to_vec(&DocMetadata {
            version: doc.version,
            updated_at: unix_millis(),
        })
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let mut batch = rocksdb::WriteBatch::default();
        batch.put_cf(&self.cf(CF_DOCUMENTS)?, key.as_bytes(), &data_json);
        batch.put_cf(&self.cf(CF_CRDT)?, key.as_bytes(), &crdt_compressed);
        batch.put_cf(&self.cf(CF_METADATA)?, key.as_bytes(), &meta);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}
