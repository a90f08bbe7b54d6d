//! RocksDB-backed durable store for rooms.
//!
//! Column families:
//! - `snapshots` — Full Yrs document snapshots (LZ4 compressed), keyed by room name
//! - `updates`   — Append-only incremental update log (LZ4 compressed,
//!   keyed by `room name + 0x00 + sequence`)
//! - `auth`      — Room passwords, keyed by room name (set once, never overwritten)
//! - `meta`      — Room metadata (bincode: created_at, update_count, sizes)
//!
//! The password column family is the durable source of truth for admission:
//! `password()` always goes to the database, never through an in-process cache.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Column family names.
const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_AUTH: &str = "auth";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_AUTH, CF_META];

/// Separator between room name and sequence number in update keys.
/// Room names come from URL path segments and cannot contain NUL.
const KEY_SEP: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false — flushed on shutdown)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./storage-location"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
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

/// Room metadata stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMetadata {
    /// Room name (redundant with the key, useful for listing)
    pub name: String,
    /// Number of updates appended since the last snapshot compaction
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(name: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_string(),
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Room has no durable record
    NotFound(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// I/O error
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(name) => write!(f, "Room not found: {name}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed room store.
///
/// Provides durable storage for room documents and passwords:
/// - LZ4-compressed snapshots and incremental updates
/// - Set-once password records
/// - Atomic write batches for snapshot + metadata consistency
pub struct RoomStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Global sequence number for update-log entries
    sequence: AtomicU64,
    /// Test hook: when set, password reads fail as if the database were gone
    #[cfg(test)]
    fault_auth_reads: std::sync::atomic::AtomicBool,
}

impl RoomStore {
    /// Open the room store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        // Recover the sequence counter from the update log
        let sequence = Self::recover_sequence(&db);

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            #[cfg(test)]
            fault_auth_reads: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Snapshots are large, written at hydration and compaction
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small writes, prefix-scanned by room name
                opts.set_max_write_buffer_number(4);
            }
            CF_AUTH | CF_META => {
                // Small values, frequent point reads on the admission path
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Recover the last sequence number from the updates column family.
    ///
    /// Sequence numbers are global across rooms and only need to be
    /// monotonic, so the highest trailing 8 bytes of any key suffice.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_UPDATES) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut max_seq = 0u64;
        let iter = db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter.flatten() {
            let (key, _) = item;
            if key.len() >= 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[key.len() - 8..]);
                let seq = u64::from_be_bytes(buf);
                max_seq = max_seq.max(seq + 1);
            }
        }
        max_seq
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full document snapshot (LZ4 compressed).
    ///
    /// The snapshot is the full Yrs document state encoded with `encode_v1`.
    /// Snapshot and metadata are written in one atomic batch.
    pub fn save_snapshot(&self, name: &str, snapshot: &[u8]) -> Result<RoomMetadata, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(name)
            .unwrap_or_else(|_| RoomMetadata::new(name));
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, name.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, name.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a room's document snapshot (LZ4 decompressed).
    ///
    /// Returns the raw Yrs document state for `apply_update`.
    pub fn load_snapshot(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;

        match self.db.get_cf(&cf, name.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    /// Check if a room has any durable record (snapshot or password).
    pub fn room_exists(&self, name: &str) -> Result<bool, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_auth = self.cf(CF_AUTH)?;
        Ok(self.db.get_cf(&cf_snap, name.as_bytes())?.is_some()
            || self.db.get_cf(&cf_auth, name.as_bytes())?.is_some())
    }

    // ─── Update log ───────────────────────────────────────────────────

    /// Append an incremental update to a room's log.
    ///
    /// Key format: `<room name><0x00><sequence: 8 bytes big-endian>`.
    /// Value: LZ4-compressed update payload. Returns the sequence assigned.
    pub fn append_update(&self, name: &str, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = Self::update_key(name, seq);
        let compressed = lz4_flex::compress_prepend_size(update);

        let mut meta = self
            .load_metadata(name)
            .unwrap_or_else(|_| RoomMetadata::new(name));
        meta.update_count += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, &key, &compressed);
        batch.put_cf(&cf_meta, name.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(seq)
    }

    /// Load all logged updates for a room, in sequence order.
    pub fn load_updates(&self, name: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = Self::update_prefix(name);

        let mut updates = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            if key.len() < prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }

            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[key.len() - 8..]);
            let seq = u64::from_be_bytes(seq_buf);

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;

            updates.push((seq, decompressed));
        }

        Ok(updates)
    }

    /// Delete a room's logged updates up to and including a sequence number.
    ///
    /// Called after a fresh snapshot has captured their effect.
    pub fn compact_updates(&self, name: &str, up_to_seq: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;
        let prefix = Self::update_prefix(name);

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }

            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[key.len() - 8..]);
            if u64::from_be_bytes(seq_buf) > up_to_seq {
                break;
            }

            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            // Keep update_count meaning "appended since the last compaction"
            if let Ok(mut meta) = self.load_metadata(name) {
                meta.update_count = meta.update_count.saturating_sub(count);
                meta.updated_at = unix_now();
                batch.put_cf(&cf_meta, name.as_bytes(), &meta.encode()?);
            }
            self.db.write(batch)?;
        }

        Ok(count)
    }

    // ─── Passwords ────────────────────────────────────────────────────

    /// Load the durable password for a room.
    ///
    /// `None` means the room has never been claimed. An empty string is a
    /// valid stored password ("no password required") and is distinct from
    /// absence. Always reads the database — this is the durable source of
    /// truth for admission and is never cached in front of RocksDB.
    pub fn password(&self, name: &str) -> Result<Option<String>, StoreError> {
        #[cfg(test)]
        if self.fault_auth_reads.load(Ordering::Relaxed) {
            return Err(StoreError::DatabaseError(
                "injected fault: auth column family unavailable".into(),
            ));
        }

        let cf = self.cf(CF_AUTH)?;
        match self.db.get_cf(&cf, name.as_bytes())? {
            Some(bytes) => {
                let pw = String::from_utf8(bytes)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(Some(pw))
            }
            None => Ok(None),
        }
    }

    /// Set a room's password if none is stored yet.
    ///
    /// Returns the stored value after the call: the supplied password when
    /// this call claimed the room, or the pre-existing one otherwise. A
    /// present value (even the empty string) is never overwritten.
    ///
    /// Read-then-write is not atomic at the database level; first-touch
    /// callers serialize through the authorizer's critical section.
    pub fn set_password_if_absent(&self, name: &str, password: &str) -> Result<String, StoreError> {
        if let Some(existing) = self.password(name)? {
            return Ok(existing);
        }

        let cf = self.cf(CF_AUTH)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, name.as_bytes(), password.as_bytes(), &write_opts)?;

        Ok(password.to_string())
    }

    /// Test hook: make password reads fail, to exercise fail-closed
    /// admission paths that are unreachable with a healthy database.
    #[cfg(test)]
    pub fn fail_auth_reads(&self, fail: bool) {
        self.fault_auth_reads.store(fail, Ordering::Relaxed);
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Load room metadata.
    pub fn load_metadata(&self, name: &str) -> Result<RoomMetadata, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, name.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    /// List all room names with a metadata record.
    pub fn room_names(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut names = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            names.push(name);
        }

        Ok(names)
    }

    /// Force a flush of memtables to disk (called once at shutdown).
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Current update-log sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Key prefix for a room's update-log entries.
    fn update_prefix(name: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(name.len() + 1);
        prefix.extend_from_slice(name.as_bytes());
        prefix.push(KEY_SEP);
        prefix
    }

    /// Build an update key: room name + 0x00 + sequence (8 bytes big-endian).
    fn update_key(name: &str, seq: u64) -> Vec<u8> {
        let mut key = Self::update_prefix(name);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
