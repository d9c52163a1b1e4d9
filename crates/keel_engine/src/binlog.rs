//! Append-only per-shard binlog.
//!
//! Committed transactions are recorded as length-prefixed, CRC32-checked
//! records in a single log file per shard. The full log is replayed into an
//! ordered in-memory index on open; cursors read from that index under a
//! shared lock so they observe a consistent view for their whole lifetime.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::RwLockReadGuard;

use crc32fast::Hasher;

use crate::error::EngineError;

/// Smallest transaction id a real entry can carry; `0` is reserved.
pub const MIN_VALID_TXNID: u64 = 1;

/// File name used for a shard's binlog within its directory.
const BINLOG_FILE: &str = "binlog.log";

/// One committed mutation recorded inside a binlog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinlogOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

/// An immutable record read back off the binlog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub txn_id: u64,
    pub unix_ms: u64,
    pub ops: Vec<BinlogOp>,
}

/// A shard's binlog: open append handle plus the replayed entry index.
#[derive(Debug)]
pub struct Binlog {
    file: File,
    entries: BTreeMap<u64, LogEntry>,
}

impl Binlog {
    /// Open or create a binlog directory and replay all complete records.
    pub fn open_dir(dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(BINLOG_FILE);
        let loaded = read_log_entries(&path)?;
        let mut entries = BTreeMap::new();
        for entry in loaded {
            entries.insert(entry.txn_id, entry);
        }
        let file = open_log_for_append(&path)?;
        Ok(Self { file, entries })
    }

    /// Append one entry durably, then index it. Returns the indexed entry.
    pub fn append(&mut self, entry: LogEntry) -> Result<&LogEntry, EngineError> {
        let payload = encode_entry(&entry);
        write_record(&mut self.file, &payload)?;
        self.file.flush()?;
        let txn_id = entry.txn_id;
        Ok(self.entries.entry(txn_id).or_insert(entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_txn_id(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    pub fn last_txn_id(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    /// Entries in txn-id order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values()
    }

    fn first_at_or_after(&self, txn_id: u64) -> Option<&LogEntry> {
        self.entries.range(txn_id..).next().map(|(_, entry)| entry)
    }
}

/// Transaction-scoped reader over a shard's binlog.
///
/// Holds the binlog's shared lock for its whole lifetime, so the entries it
/// walks cannot change underneath it. Bounded below by the minimum txn id
/// it was created with.
pub struct BinlogCursor<'t> {
    log: RwLockReadGuard<'t, Binlog>,
    next: u64,
}

impl<'t> BinlogCursor<'t> {
    pub(crate) fn new(log: RwLockReadGuard<'t, Binlog>, min_txn_id: u64) -> Self {
        Self {
            log,
            next: min_txn_id.max(MIN_VALID_TXNID),
        }
    }

    /// Move the cursor onto the newest entry at or after its lower bound.
    pub fn seek_to_last(&mut self) {
        if let Some(last) = self.log.last_txn_id() {
            if last >= self.next {
                self.next = last;
            }
        }
    }

    /// Produce the entry at the cursor position and advance past it.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<LogEntry, EngineError> {
        let Some(entry) = self.log.first_at_or_after(self.next) else {
            return Err(EngineError::Exhausted(
                "no binlog entry at or after cursor position".to_string(),
            ));
        };
        self.next = entry.txn_id + 1;
        Ok(entry.clone())
    }
}

/// Open the binlog file for appending.
fn open_log_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Write a single length-prefixed record with CRC32 checksum.
fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

/// Read and decode all binlog records from disk.
fn read_log_entries(path: &Path) -> Result<Vec<LogEntry>, EngineError> {
    let file = match File::open(path) {
        Ok(file) => file,
        // A missing log means no entries to replay.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            // EOF means all complete records have been read.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Err(EngineError::Corrupt("binlog checksum mismatch".to_string()));
        }
        entries.push(decode_entry(&payload)?);
    }
    Ok(entries)
}

/// Encode an entry to its compact binary payload.
fn encode_entry(entry: &LogEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + 4 + entry.ops.len() * 16);
    out.extend_from_slice(&entry.txn_id.to_be_bytes());
    out.extend_from_slice(&entry.unix_ms.to_be_bytes());
    out.extend_from_slice(&(entry.ops.len() as u32).to_be_bytes());
    for op in &entry.ops {
        match op {
            BinlogOp::Put { key, value } => {
                out.push(OP_PUT);
                out.extend_from_slice(&(key.len() as u32).to_be_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                out.extend_from_slice(value);
            }
            BinlogOp::Delete { key } => {
                out.push(OP_DELETE);
                out.extend_from_slice(&(key.len() as u32).to_be_bytes());
                out.extend_from_slice(key);
            }
        }
    }
    out
}

/// Decode an entry from a record payload.
fn decode_entry(buf: &[u8]) -> Result<LogEntry, EngineError> {
    let mut offset = 0usize;
    let txn_id = read_u64_at(buf, &mut offset)?;
    let unix_ms = read_u64_at(buf, &mut offset)?;
    let op_count = read_u32_at(buf, &mut offset)? as usize;
    let mut ops = Vec::with_capacity(op_count);
    for _ in 0..op_count {
        let tag = read_u8_at(buf, &mut offset)?;
        let key = read_bytes_at(buf, &mut offset)?;
        match tag {
            OP_PUT => {
                let value = read_bytes_at(buf, &mut offset)?;
                ops.push(BinlogOp::Put { key, value });
            }
            OP_DELETE => ops.push(BinlogOp::Delete { key }),
            other => {
                return Err(EngineError::Corrupt(format!(
                    "unknown binlog op tag {other}"
                )));
            }
        }
    }
    Ok(LogEntry {
        txn_id,
        unix_ms,
        ops,
    })
}

fn read_u8_at(buf: &[u8], offset: &mut usize) -> Result<u8, EngineError> {
    let Some(byte) = buf.get(*offset) else {
        return Err(EngineError::Corrupt("binlog entry short op tag".to_string()));
    };
    *offset += 1;
    Ok(*byte)
}

fn read_u32_at(buf: &[u8], offset: &mut usize) -> Result<u32, EngineError> {
    let end = *offset + 4;
    let Some(raw) = buf.get(*offset..end) else {
        return Err(EngineError::Corrupt("binlog entry short u32".to_string()));
    };
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(raw);
    *offset = end;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64_at(buf: &[u8], offset: &mut usize) -> Result<u64, EngineError> {
    let end = *offset + 8;
    let Some(raw) = buf.get(*offset..end) else {
        return Err(EngineError::Corrupt("binlog entry short u64".to_string()));
    };
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(raw);
    *offset = end;
    Ok(u64::from_be_bytes(bytes))
}

fn read_bytes_at(buf: &[u8], offset: &mut usize) -> Result<Vec<u8>, EngineError> {
    let len = read_u32_at(buf, offset)? as usize;
    let end = *offset + len;
    let Some(raw) = buf.get(*offset..end) else {
        return Err(EngineError::Corrupt("binlog entry short field".to_string()));
    };
    *offset = end;
    Ok(raw.to_vec())
}
