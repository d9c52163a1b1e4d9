//! Process-wide server state shared by every session.

use std::sync::atomic::{AtomicBool, Ordering};

use keel_engine::{ShardSet, INSTANCE_NUM};

use crate::repl::ReplManager;
use crate::session::SessionRegistry;

pub struct ServerEntry {
    shards: ShardSet,
    repl: ReplManager,
    sessions: SessionRegistry,
    ftmc: AtomicBool,
}

impl ServerEntry {
    pub fn new(shards: ShardSet) -> Self {
        // A mis-sized shard set is a broken startup contract, not a
        // recoverable runtime condition.
        assert_eq!(
            shards.len() as u32,
            INSTANCE_NUM,
            "shard set does not match INSTANCE_NUM"
        );
        Self {
            shards,
            repl: ReplManager::new(INSTANCE_NUM),
            sessions: SessionRegistry::new(),
            ftmc: AtomicBool::new(false),
        }
    }

    pub fn shards(&self) -> &ShardSet {
        &self.shards
    }

    pub fn repl(&self) -> &ReplManager {
        &self.repl
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Enable or disable per-command timing metrics collection.
    pub fn toggle_ftmc(&self, enable: bool) {
        self.ftmc.store(enable, Ordering::Relaxed);
    }

    pub fn ftmc_enabled(&self) -> bool {
        self.ftmc.load(Ordering::Relaxed)
    }
}
