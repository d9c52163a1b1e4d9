//! Per-shard concurrency-control locks.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use crate::error::EngineError;

/// Lock modes a caller can request on a shard.
///
/// Intent-shared admits any number of concurrent holders and is excluded
/// by an exclusive holder; exclusive admits exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentShared,
    Exclusive,
}

/// One lock slot per shard, fixed at construction.
pub struct LockManager {
    shards: Vec<RwLock<()>>,
}

impl LockManager {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards).map(|_| RwLock::new(())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Block until the requested mode is granted on `shard`.
    pub fn lock(&self, shard: u32, mode: LockMode) -> Result<StoreLock<'_>, EngineError> {
        let slot = self.slot(shard)?;
        let guard = match mode {
            LockMode::IntentShared => LockGuard::Shared(
                slot.read()
                    .map_err(|_| EngineError::Storage("shard lock poisoned".to_string()))?,
            ),
            LockMode::Exclusive => LockGuard::Exclusive(
                slot.write()
                    .map_err(|_| EngineError::Storage("shard lock poisoned".to_string()))?,
            ),
        };
        Ok(StoreLock {
            shard,
            mode,
            _guard: guard,
        })
    }

    /// Non-blocking acquisition; `None` when the mode cannot be granted now.
    pub fn try_lock(&self, shard: u32, mode: LockMode) -> Result<Option<StoreLock<'_>>, EngineError> {
        let slot = self.slot(shard)?;
        let guard = match mode {
            LockMode::IntentShared => match slot.try_read() {
                Ok(guard) => LockGuard::Shared(guard),
                Err(TryLockError::WouldBlock) => return Ok(None),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(EngineError::Storage("shard lock poisoned".to_string()));
                }
            },
            LockMode::Exclusive => match slot.try_write() {
                Ok(guard) => LockGuard::Exclusive(guard),
                Err(TryLockError::WouldBlock) => return Ok(None),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(EngineError::Storage("shard lock poisoned".to_string()));
                }
            },
        };
        Ok(Some(StoreLock {
            shard,
            mode,
            _guard: guard,
        }))
    }

    fn slot(&self, shard: u32) -> Result<&RwLock<()>, EngineError> {
        self.shards
            .get(shard as usize)
            .ok_or_else(|| EngineError::Storage(format!("no lock slot for shard {shard}")))
    }
}

/// A granted shard lock; dropping it releases the lock on every exit path.
pub struct StoreLock<'a> {
    shard: u32,
    mode: LockMode,
    _guard: LockGuard<'a>,
}

impl StoreLock<'_> {
    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

enum LockGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}
