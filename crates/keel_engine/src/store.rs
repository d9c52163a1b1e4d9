//! Shard stores, transactions, and the fixed shard set.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::binlog::{Binlog, BinlogCursor, BinlogOp, LogEntry, MIN_VALID_TXNID};
use crate::error::EngineError;
use crate::lock::{LockManager, LockMode, StoreLock};

/// Number of independently lockable store instances in a process.
pub const INSTANCE_NUM: u32 = 8;

pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Live counters a store reports about itself.
struct StoreStats {
    gets: AtomicU64,
    puts: AtomicU64,
    bytes_written: AtomicU64,
}

impl StoreStats {
    const fn new() -> Self {
        Self {
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }
}

/// One shard: a fjall data partition plus its binlog and txn-id allocator.
pub struct Store {
    // Keyspace handle kept alive for the partition opened from it.
    _keyspace: Arc<Keyspace>,
    shard: u32,
    data: PartitionHandle,
    binlog: RwLock<Binlog>,
    next_txn: AtomicU64,
    stats: StoreStats,
}

impl Store {
    /// Open the shard's partition and binlog, replaying logged mutations
    /// into the partition so a crash between binlog append and data flush
    /// cannot lose a committed write.
    pub fn open(
        keyspace: &Arc<Keyspace>,
        shard: u32,
        binlog_root: &Path,
    ) -> Result<Arc<Self>, EngineError> {
        let data = keyspace.open_partition(
            &format!("kv_{shard}"),
            PartitionCreateOptions::default(),
        )?;
        let binlog = Binlog::open_dir(binlog_root.join(format!("shard_{shard}")))?;
        for entry in binlog.iter() {
            apply_ops(&data, &entry.ops)?;
        }
        let next_txn = binlog
            .last_txn_id()
            .map(|id| id + 1)
            .unwrap_or(MIN_VALID_TXNID);
        tracing::debug!(
            shard,
            entries = binlog.len(),
            next_txn,
            "binlog replayed"
        );
        Ok(Arc::new(Self {
            _keyspace: keyspace.clone(),
            shard,
            data,
            binlog: RwLock::new(binlog),
            next_txn: AtomicU64::new(next_txn),
            stats: StoreStats::new(),
        }))
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Start a transaction over this shard's current state.
    pub fn begin(&self) -> Result<Transaction<'_>, EngineError> {
        Ok(Transaction {
            store: self,
            writes: Vec::new(),
        })
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.get(key)?.map(|slice| slice.to_vec()))
    }

    /// Self-reported statistics fragment for the diagnostics document.
    ///
    /// Takes no shard lock: this is a best-effort instantaneous snapshot.
    pub fn append_stats(&self, out: &mut serde_json::Map<String, serde_json::Value>) {
        out.insert(
            "kv_gets".to_string(),
            self.stats.gets.load(Ordering::Relaxed).into(),
        );
        out.insert(
            "kv_puts".to_string(),
            self.stats.puts.load(Ordering::Relaxed).into(),
        );
        out.insert(
            "bytes_written".to_string(),
            self.stats.bytes_written.load(Ordering::Relaxed).into(),
        );
        out.insert(
            "next_txn_id".to_string(),
            self.next_txn.load(Ordering::Relaxed).into(),
        );
        if let Ok(log) = self.binlog.read() {
            out.insert("binlog_entries".to_string(), (log.len() as u64).into());
            out.insert(
                "binlog_min_txn".to_string(),
                log.first_txn_id().unwrap_or(0).into(),
            );
            out.insert(
                "binlog_max_txn".to_string(),
                log.last_txn_id().unwrap_or(0).into(),
            );
        }
    }
}

fn apply_ops(data: &PartitionHandle, ops: &[BinlogOp]) -> Result<(), EngineError> {
    for op in ops {
        match op {
            BinlogOp::Put { key, value } => data.insert(key, value)?,
            BinlogOp::Delete { key } => data.remove(key)?,
        }
    }
    Ok(())
}

/// One shard-scoped transactional view with buffered writes.
///
/// Read-only use is just `begin` + reads + drop; `commit` assigns the next
/// monotonic txn id, appends one binlog entry, then applies the writes.
pub struct Transaction<'s> {
    store: &'s Store,
    writes: Vec<BinlogOp>,
}

impl<'s> Transaction<'s> {
    /// Read a key, observing this transaction's own buffered writes first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        for op in self.writes.iter().rev() {
            match op {
                BinlogOp::Put { key: k, value } if k.as_slice() == key => {
                    return Ok(Some(value.clone()));
                }
                BinlogOp::Delete { key: k } if k.as_slice() == key => return Ok(None),
                _ => {}
            }
        }
        self.store.get_raw(key)
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.push(BinlogOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.push(BinlogOp::Delete { key });
    }

    /// Open a binlog cursor bounded below by `min_txn_id`.
    ///
    /// The cursor borrows this transaction and cannot outlive it.
    pub fn binlog_cursor(&self, min_txn_id: u64) -> Result<BinlogCursor<'_>, EngineError> {
        let guard = self
            .store
            .binlog
            .read()
            .map_err(|_| EngineError::Storage("binlog lock poisoned".to_string()))?;
        Ok(BinlogCursor::new(guard, min_txn_id))
    }

    /// Commit buffered writes. Returns the assigned txn id, or `None` when
    /// the transaction wrote nothing (no binlog entry is produced).
    pub fn commit(self) -> Result<Option<u64>, EngineError> {
        let Transaction { store, writes } = self;
        if writes.is_empty() {
            return Ok(None);
        }
        let bytes: u64 = writes
            .iter()
            .map(|op| match op {
                BinlogOp::Put { key, value } => (key.len() + value.len()) as u64,
                BinlogOp::Delete { key } => key.len() as u64,
            })
            .sum();
        let mut log = store
            .binlog
            .write()
            .map_err(|_| EngineError::Storage("binlog lock poisoned".to_string()))?;
        // Allocate under the write lock so append order matches id order.
        let txn_id = store.next_txn.fetch_add(1, Ordering::SeqCst);
        let entry = log.append(LogEntry {
            txn_id,
            unix_ms: unix_time_ms(),
            ops: writes,
        })?;
        apply_ops(&store.data, &entry.ops)?;
        store
            .stats
            .puts
            .fetch_add(entry.ops.len() as u64, Ordering::Relaxed);
        store
            .stats
            .bytes_written
            .fetch_add(bytes, Ordering::Relaxed);
        Ok(Some(txn_id))
    }
}

/// The fixed set of shard stores plus their lock table.
pub struct ShardSet {
    stores: Vec<Arc<Store>>,
    locks: LockManager,
}

impl ShardSet {
    /// Open all `INSTANCE_NUM` shard stores under one keyspace.
    pub fn open(keyspace: &Arc<Keyspace>, binlog_root: &Path) -> Result<Self, EngineError> {
        let mut stores = Vec::with_capacity(INSTANCE_NUM as usize);
        for shard in 0..INSTANCE_NUM {
            stores.push(Store::open(keyspace, shard, binlog_root)?);
        }
        Ok(Self {
            stores,
            locks: LockManager::new(INSTANCE_NUM as usize),
        })
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Resolve a shard index to its live store handle.
    pub fn get(&self, shard: u32) -> Option<Arc<Store>> {
        self.stores.get(shard as usize).cloned()
    }

    pub fn lock(&self, shard: u32, mode: LockMode) -> Result<StoreLock<'_>, EngineError> {
        self.locks.lock(shard, mode)
    }

    pub fn try_lock(
        &self,
        shard: u32,
        mode: LockMode,
    ) -> Result<Option<StoreLock<'_>>, EngineError> {
        self.locks.try_lock(shard, mode)
    }

    /// Route a key to its owning shard.
    pub fn shard_for_key(&self, key: &[u8]) -> u32 {
        (hash_key(key) % self.stores.len() as u64) as u32
    }
}
