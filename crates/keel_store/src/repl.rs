//! Replication state surface reported through the diagnostics command.
//!
//! Stream negotiation and shipping live elsewhere; this layer only tracks
//! what the write path tells it and reports that state on request.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};

/// Per-shard replication bookkeeping fed by the write path.
struct ReplState {
    last_binlog_id: AtomicU64,
    commits: AtomicU64,
}

pub struct ReplManager {
    shards: Vec<ReplState>,
}

impl ReplManager {
    pub fn new(shards: u32) -> Self {
        Self {
            shards: (0..shards)
                .map(|_| ReplState {
                    last_binlog_id: AtomicU64::new(0),
                    commits: AtomicU64::new(0),
                })
                .collect(),
        }
    }

    /// Record a committed transaction for asynchronous shipping.
    pub fn observe_commit(&self, shard: u32, txn_id: u64) {
        if let Some(state) = self.shards.get(shard as usize) {
            state.commits.fetch_add(1, Ordering::Relaxed);
            state.last_binlog_id.fetch_max(txn_id, Ordering::Relaxed);
        }
    }

    /// Self-reported statistics fragment for the diagnostics document.
    pub fn append_stats(&self, out: &mut Map<String, Value>) {
        out.insert("role".to_string(), "master".into());
        for (shard, state) in self.shards.iter().enumerate() {
            let mut obj = Map::new();
            obj.insert(
                "last_binlog_id".to_string(),
                state.last_binlog_id.load(Ordering::Relaxed).into(),
            );
            obj.insert(
                "commits".to_string(),
                state.commits.load(Ordering::Relaxed).into(),
            );
            out.insert(format!("shard_{shard}"), Value::Object(obj));
        }
    }
}
