//! RocksDB-backed entity store.
//!
//! Column families:
//! - `chapters`: chapter entities
//! - `tracks`: track entities, including their bounded history
//!
//! Keys are the 16 raw bytes of the entity id. Values are JSON, prefixed
//! with one format byte: `0` raw, `1` LZ4 (size-prepended).

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteOptions,
};
use serde_json::Value;
use uuid::Uuid;

use super::{EntityKind, EntityStore, StoreError};

const FORMAT_RAW: u8 = 0;
const FORMAT_LZ4: u8 = 1;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
    /// LZ4-compress values before writing (default: true)
    pub compress: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("montage_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
            compress: true,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, for temp directories in tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            compress: true,
        }
    }
}

/// Durable [`EntityStore`] with one column family per entity kind.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = EntityKind::ALL
            .iter()
            .map(|kind| ColumnFamilyDescriptor::new(kind.name(), Self::cf_options(*kind, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("opened entity store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(kind: EntityKind, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        match kind {
            EntityKind::Chapter => {
                // small and rarely rewritten
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            EntityKind::Track => {
                // rewritten on every accepted delta; values are already LZ4
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(if config.compress {
                    DBCompressionType::None
                } else {
                    DBCompressionType::Lz4
                });
            }
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, kind: EntityKind) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(kind.name())
            .ok_or_else(|| StoreError::Database(format!("column family '{}' not found", kind.name())))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StoreError> {
        let json = serde_json::to_vec(value)?;
        let mut out = Vec::with_capacity(json.len() + 1);
        if self.config.compress {
            out.push(FORMAT_LZ4);
            out.extend_from_slice(&lz4_flex::compress_prepend_size(&json));
        } else {
            out.push(FORMAT_RAW);
            out.extend_from_slice(&json);
        }
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Value, StoreError> {
        match bytes.split_first() {
            Some((&FORMAT_RAW, json)) => Ok(serde_json::from_slice(json)?),
            Some((&FORMAT_LZ4, packed)) => {
                let json = lz4_flex::decompress_size_prepended(packed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(serde_json::from_slice(&json)?)
            }
            Some((format, _)) => Err(StoreError::Serialization(format!("unknown value format {format}"))),
            None => Err(StoreError::Serialization("empty value".into())),
        }
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl EntityStore for RocksStore {
    fn read(&self, kind: EntityKind, id: Uuid) -> Result<Option<Value>, StoreError> {
        let cf = self.cf(kind)?;
        self.db
            .get_cf(&cf, id.as_bytes())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    fn write(&self, kind: EntityKind, id: Uuid, value: &Value) -> Result<(), StoreError> {
        let cf = self.cf(kind)?;
        let bytes = self.encode(value)?;
        self.db.put_cf_opt(&cf, id.as_bytes(), &bytes, &self.write_opts())?;
        Ok(())
    }

    fn delete(&self, kind: EntityKind, id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(kind)?;
        if self.db.get_pinned_cf(&cf, id.as_bytes())?.is_none() {
            return Ok(false);
        }
        self.db.delete_cf_opt(&cf, id.as_bytes(), &self.write_opts())?;
        Ok(true)
    }

    fn list(&self, kind: EntityKind) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(kind)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Serialization(format!("invalid {kind} key of {} bytes", key.len())))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
