//! Byte-cache storage engine.
//!
//! A persistent, size-bounded key→blob store behind the narrow
//! [`ByteCache`] contract the proxy core needs: get-by-key with a
//! bounded wait, transactional puts with explicit commit/rollback,
//! per-item TTL, and sharding across independently sized stores.
//!
//! Commit atomicity is the load-bearing guarantee: a transaction
//! stages bytes privately and publishes them with a single map insert,
//! so a concurrent reader sees either no entry or the full blob.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use lru::LruCache;
use thiserror::Error;
use tracing::{info, warn};

use super::lock::{mutex_lock, mutex_lock_deadline};

const SOURCE: &str = "cache::store";

const SNAPSHOT_MAGIC: u32 = 0x5246_4643; // "RFFC"
const SNAPSHOT_VERSION: u8 = 1;

/// Engine configuration forwarded at startup.
///
/// `paths` lists the backing file locations, one per shard; an empty
/// list opens a single anonymous in-memory store. Capacity and item
/// budgets are totals, split evenly across shards.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub paths: Vec<PathBuf>,
    pub total_capacity_bytes: u64,
    pub max_items: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timed out waiting for a shard lock")]
    Timeout,
    #[error("item of {size} bytes exceeds shard capacity of {capacity} bytes")]
    TooLarge { size: usize, capacity: u64 },
    #[error("transaction wrote {written} of {declared} declared bytes")]
    ShortWrite { written: usize, declared: usize },
    #[error("transaction write exceeds the declared size of {declared} bytes")]
    DeclaredSizeExceeded { declared: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot at `{path}` is corrupt: {reason}")]
    CorruptSnapshot { path: PathBuf, reason: String },
}

/// An in-flight set transaction.
///
/// Bytes become visible to readers only after `commit` returns; drop
/// or `rollback` before that leaves no trace.
pub trait SetTxn: Send {
    /// Append bytes to the staged blob. Must follow the exact sequence
    /// that produces the declared blob.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StoreError>;
    /// Publish the staged blob and return it.
    fn commit(self: Box<Self>) -> Result<Bytes, StoreError>;
    /// Discard the staged blob.
    fn rollback(self: Box<Self>);
}

/// The storage contract the request orchestrator programs against.
pub trait ByteCache: Send + Sync {
    /// Look up a blob, waiting at most `timeout` for the store.
    fn get(&self, key: &[u8], timeout: Duration) -> Result<Option<Bytes>, StoreError>;

    /// Start a transactional put. `total_size` must equal the exact
    /// final blob size; the store preallocates by it, and a mismatch
    /// surfaces at write or commit time.
    fn begin_put(
        &self,
        key: &[u8],
        total_size: usize,
        ttl: Option<Duration>,
    ) -> Result<Box<dyn SetTxn>, StoreError>;

    /// Flush and release the store. Called once at shutdown.
    fn close(&self) -> Result<(), StoreError>;
}

// ============================================================================
// Sharded store
// ============================================================================

/// Bundled [`ByteCache`] implementation: N shards, each a size-bounded
/// LRU map with optional snapshot files (`<path>.data` + `<path>.index`).
pub struct ShardedStore {
    shards: Vec<Arc<Shard>>,
}

impl ShardedStore {
    /// Open the store, loading shard snapshots where backing paths are
    /// configured. Snapshot corruption is a hard error: a partially
    /// loaded cache would silently serve the wrong working set.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let shard_count = config.paths.len().max(1);
        let capacity_bytes = (config.total_capacity_bytes / shard_count as u64).max(1);
        let max_items = NonZeroUsize::new(config.max_items / shard_count)
            .unwrap_or(NonZeroUsize::MIN);

        let mut shards = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let path = config.paths.get(index).cloned();
            let shard = Shard::open(path, capacity_bytes, max_items)?;
            shards.push(Arc::new(shard));
        }

        info!(
            target: "raffica::cache",
            shards = shard_count,
            capacity_bytes_per_shard = capacity_bytes,
            max_items_per_shard = max_items.get(),
            "Cache store opened"
        );
        Ok(Self { shards })
    }

    fn shard_for(&self, key: &[u8]) -> &Arc<Shard> {
        &self.shards[super::key::shard_index(key, self.shards.len())]
    }
}

impl ByteCache for ShardedStore {
    fn get(&self, key: &[u8], timeout: Duration) -> Result<Option<Bytes>, StoreError> {
        self.shard_for(key).get(key, timeout)
    }

    fn begin_put(
        &self,
        key: &[u8],
        total_size: usize,
        ttl: Option<Duration>,
    ) -> Result<Box<dyn SetTxn>, StoreError> {
        let shard = Arc::clone(self.shard_for(key));
        let txn = shard.begin_put(key, total_size, ttl)?;
        Ok(Box::new(txn))
    }

    fn close(&self) -> Result<(), StoreError> {
        for shard in &self.shards {
            shard.snapshot()?;
        }
        Ok(())
    }
}

struct Entry {
    blob: Bytes,
    expires_at: Option<SystemTime>,
}

impl Entry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct ShardState {
    entries: LruCache<Vec<u8>, Entry>,
    bytes: u64,
}

struct Shard {
    state: Mutex<ShardState>,
    path: Option<PathBuf>,
    capacity_bytes: u64,
}

impl Shard {
    fn open(
        path: Option<PathBuf>,
        capacity_bytes: u64,
        max_items: NonZeroUsize,
    ) -> Result<Self, StoreError> {
        let shard = Self {
            state: Mutex::new(ShardState {
                entries: LruCache::new(max_items),
                bytes: 0,
            }),
            path,
            capacity_bytes,
        };
        shard.load_snapshot()?;
        Ok(shard)
    }

    fn get(&self, key: &[u8], timeout: Duration) -> Result<Option<Bytes>, StoreError> {
        let mut state = mutex_lock_deadline(&self.state, timeout, SOURCE, "get")
            .ok_or(StoreError::Timeout)?;

        let expired = match state.entries.get(key) {
            Some(entry) if entry.is_expired(SystemTime::now()) => true,
            Some(entry) => return Ok(Some(entry.blob.clone())),
            None => return Ok(None),
        };
        if expired
            && let Some(entry) = state.entries.pop(key)
        {
            state.bytes -= (key.len() + entry.blob.len()) as u64;
        }
        Ok(None)
    }

    fn begin_put(
        self: &Arc<Self>,
        key: &[u8],
        total_size: usize,
        ttl: Option<Duration>,
    ) -> Result<ShardTxn, StoreError> {
        let item_size = (key.len() + total_size) as u64;
        if item_size > self.capacity_bytes {
            return Err(StoreError::TooLarge {
                size: key.len() + total_size,
                capacity: self.capacity_bytes,
            });
        }
        Ok(ShardTxn {
            shard: Arc::clone(self),
            key: key.to_vec(),
            declared: total_size,
            staged: BytesMut::with_capacity(total_size),
            expires_at: ttl.map(|ttl| SystemTime::now() + ttl),
        })
    }

    /// Insert a committed blob, evicting least-recently-used entries
    /// until both the item and byte budgets hold.
    fn insert(&self, key: Vec<u8>, entry: Entry) {
        let mut state = mutex_lock(&self.state, SOURCE, "insert");
        let added = (key.len() + entry.blob.len()) as u64;

        if let Some((old_key, old)) = state.entries.push(key, entry) {
            // push replaces an equal key or reports the LRU casualty
            state.bytes -= (old_key.len() + old.blob.len()) as u64;
        }
        state.bytes += added;

        while state.bytes > self.capacity_bytes {
            match state.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    state.bytes -= (evicted_key.len() + evicted.blob.len()) as u64;
                }
                None => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Snapshot persistence
    // ------------------------------------------------------------------

    fn load_snapshot(&self) -> Result<(), StoreError> {
        let Some(base) = self.path.as_ref() else {
            return Ok(());
        };
        let index_path = snapshot_path(base, "index");
        let data_path = snapshot_path(base, "data");
        if !index_path.exists() || !data_path.exists() {
            return Ok(());
        }

        let corrupt = |reason: String| StoreError::CorruptSnapshot {
            path: index_path.clone(),
            reason,
        };

        let mut index = BufReader::new(File::open(&index_path)?);
        let magic = read_u32(&mut index)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(corrupt(format!("bad magic {magic:#010x}")));
        }
        let version = read_u8(&mut index)?;
        if version != SNAPSHOT_VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let count = read_u64(&mut index)?;

        let mut data = BufReader::new(File::open(&data_path)?);
        let now = SystemTime::now();
        let mut state = mutex_lock(&self.state, SOURCE, "load_snapshot");
        for _ in 0..count {
            let key_len = read_u32(&mut index)? as usize;
            let blob_len = read_u32(&mut index)? as usize;
            let expires_ms = read_u64(&mut index)?;

            let mut key = vec![0u8; key_len];
            data.read_exact(&mut key)
                .map_err(|err| corrupt(format!("truncated key: {err}")))?;
            let mut blob = vec![0u8; blob_len];
            data.read_exact(&mut blob)
                .map_err(|err| corrupt(format!("truncated blob: {err}")))?;

            let expires_at = (expires_ms > 0)
                .then(|| UNIX_EPOCH + Duration::from_millis(expires_ms));
            let entry = Entry {
                blob: Bytes::from(blob),
                expires_at,
            };
            if entry.is_expired(now) {
                continue;
            }
            state.bytes += (key.len() + entry.blob.len()) as u64;
            if let Some((evicted_key, evicted)) = state.entries.push(key, entry) {
                // The snapshot can hold more entries than the current
                // item budget allows; keep the byte accounting in step
                // with what actually survived the load.
                state.bytes -= (evicted_key.len() + evicted.blob.len()) as u64;
            }
        }
        drop(state);

        info!(
            target: "raffica::cache",
            path = %base.display(),
            entries = count,
            "Loaded shard snapshot"
        );
        Ok(())
    }

    fn snapshot(&self) -> Result<(), StoreError> {
        let Some(base) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = base.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let state = mutex_lock(&self.state, SOURCE, "snapshot");
        let mut index = BufWriter::new(File::create(snapshot_path(base, "index"))?);
        let mut data = BufWriter::new(File::create(snapshot_path(base, "data"))?);

        index.write_all(&SNAPSHOT_MAGIC.to_le_bytes())?;
        index.write_all(&[SNAPSHOT_VERSION])?;
        index.write_all(&(state.entries.len() as u64).to_le_bytes())?;

        // Written least-recently-used first, so the load-time pushes
        // reproduce the recency order instead of inverting it.
        for (key, entry) in state.entries.iter().rev() {
            let expires_ms = entry
                .expires_at
                .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |since| since.as_millis() as u64);
            index.write_all(&(key.len() as u32).to_le_bytes())?;
            index.write_all(&(entry.blob.len() as u32).to_le_bytes())?;
            index.write_all(&expires_ms.to_le_bytes())?;
            data.write_all(key)?;
            data.write_all(&entry.blob)?;
        }
        index.flush()?;
        data.flush()?;

        info!(
            target: "raffica::cache",
            path = %base.display(),
            entries = state.entries.len(),
            "Wrote shard snapshot"
        );
        Ok(())
    }
}

fn snapshot_path(base: &Path, extension: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

fn read_u8(reader: &mut impl Read) -> Result<u8, StoreError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(reader: &mut impl Read) -> Result<u32, StoreError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, StoreError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

// ============================================================================
// Transaction
// ============================================================================

struct ShardTxn {
    shard: Arc<Shard>,
    key: Vec<u8>,
    declared: usize,
    staged: BytesMut,
    expires_at: Option<SystemTime>,
}

impl SetTxn for ShardTxn {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StoreError> {
        if self.staged.len() + bytes.len() > self.declared {
            return Err(StoreError::DeclaredSizeExceeded {
                declared: self.declared,
            });
        }
        self.staged.put_slice(bytes);
        Ok(bytes.len())
    }

    fn commit(self: Box<Self>) -> Result<Bytes, StoreError> {
        if self.staged.len() != self.declared {
            return Err(StoreError::ShortWrite {
                written: self.staged.len(),
                declared: self.declared,
            });
        }
        let blob = self.staged.freeze();
        self.shard.insert(
            self.key,
            Entry {
                blob: blob.clone(),
                expires_at: self.expires_at,
            },
        );
        Ok(blob)
    }

    fn rollback(self: Box<Self>) {
        warn!(
            target: "raffica::cache",
            staged = self.staged.len(),
            declared = self.declared,
            "Rolled back cache transaction"
        );
    }
}
