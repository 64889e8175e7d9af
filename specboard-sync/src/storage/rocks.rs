//! RocksDB-backed persistent store.
//!
//! Column families:
//! - `documents`: document content (LZ4 compressed, keyed by `project_id \0 document_type`)
//! - `conflicts`: unresolved conflicts (bincode, keyed by conflict UUID)
//! - `warnings` : integrity warnings (bincode, keyed by warning UUID)
//!
//! Conflicts and warnings survive restarts until they are resolved or dismissed.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{sort_conflicts, sort_warnings, ConflictStore, DocumentStore, StoreError};
use crate::conflict::{Conflict, IntegrityWarning};
use crate::protocol::DocumentType;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_CONFLICTS: &str = "conflicts";
const CF_WARNINGS: &str = "warnings";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CONFLICTS, CF_WARNINGS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true, conflicts must not be lost)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("specboard_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB store implementing both [`DocumentStore`] and [`ConflictStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, column families are fixed at open)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Content is LZ4 compressed before it reaches RocksDB
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CONFLICTS | CF_WARNINGS => {
                // Small records, full scans when listing a project
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn document_key(project_id: &str, document_type: DocumentType) -> Vec<u8> {
        let mut key = Vec::with_capacity(project_id.len() + 1 + 12);
        key.extend_from_slice(project_id.as_bytes());
        key.push(0);
        key.extend_from_slice(document_type.as_str().as_bytes());
        key
    }

    fn put_record<T: Serialize>(&self, cf_name: &str, id: Uuid, record: &T) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        let bytes = encode(record)?;
        self.db.put_cf_opt(cf, id.as_bytes(), bytes, &self.write_options())?;
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, cf_name: &str, id: Uuid) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_record(&self, cf_name: &str, id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(cf_name)?;
        if self.db.get_cf(cf, id.as_bytes())?.is_none() {
            return Ok(false);
        }
        self.db.delete_cf_opt(cf, id.as_bytes(), &self.write_options())?;
        Ok(true)
    }

    fn scan_records<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    fn count_records(&self, cf_name: &str) -> Result<usize, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }
}

impl DocumentStore for RocksStore {
    fn read(&self, project_id: &str, document_type: DocumentType) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, Self::document_key(project_id, document_type))? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))
            }
            None => Ok(None),
        }
    }

    fn write(&self, project_id: &str, document_type: DocumentType, content: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());
        self.db.put_cf_opt(
            cf,
            Self::document_key(project_id, document_type),
            compressed,
            &self.write_options(),
        )?;
        Ok(())
    }
}

impl ConflictStore for RocksStore {
    fn put_conflict(&self, conflict: &Conflict) -> Result<(), StoreError> {
        self.put_record(CF_CONFLICTS, conflict.id, conflict)
    }

    fn get_conflict(&self, id: Uuid) -> Result<Option<Conflict>, StoreError> {
        self.get_record(CF_CONFLICTS, id)
    }

    fn list_conflicts(&self, project_id: &str) -> Result<Vec<Conflict>, StoreError> {
        let mut conflicts: Vec<Conflict> = self
            .scan_records::<Conflict>(CF_CONFLICTS)?
            .into_iter()
            .filter(|c| c.project_id == project_id)
            .collect();
        sort_conflicts(&mut conflicts);
        Ok(conflicts)
    }

    fn delete_conflict(&self, id: Uuid) -> Result<bool, StoreError> {
        self.delete_record(CF_CONFLICTS, id)
    }

    fn put_warning(&self, warning: &IntegrityWarning) -> Result<(), StoreError> {
        self.put_record(CF_WARNINGS, warning.id, warning)
    }

    fn list_warnings(&self, project_id: &str) -> Result<Vec<IntegrityWarning>, StoreError> {
        let mut warnings: Vec<IntegrityWarning> = self
            .scan_records::<IntegrityWarning>(CF_WARNINGS)?
            .into_iter()
            .filter(|w| w.project_id == project_id)
            .collect();
        sort_warnings(&mut warnings);
        Ok(warnings)
    }

    fn delete_warning(&self, id: Uuid) -> Result<bool, StoreError> {
        self.delete_record(CF_WARNINGS, id)
    }

    fn counts(&self) -> Result<(usize, usize), StoreError> {
        Ok((self.count_records(CF_CONFLICTS)?, self.count_records(CF_WARNINGS)?))
    }
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(record)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
