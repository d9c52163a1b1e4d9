//! Basic data-path commands.
//!
//! These route by key hash to a shard, pick the lock mode the access
//! needs, and (for writes) feed the per-shard binlog that `binlogpos`
//! reads back.

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;

use keel_engine::LockMode;

use crate::command::{ok_frame, register_command, Command, CommandError, KeySpec};
use crate::session::Session;

/// Liveness probe.
pub struct Ping;

impl Ping {
    pub const fn new() -> Self {
        Self
    }
}

impl Command for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn arity(&self) -> i32 {
        1
    }

    fn run(&self, _sess: &Session, _args: &[String]) -> Result<BytesFrame, CommandError> {
        Ok(BytesFrame::SimpleString(Bytes::from_static(b"PONG")))
    }
}

register_command!(Ping);

/// Read one key from its owning shard.
pub struct Get;

impl Get {
    pub const fn new() -> Self {
        Self
    }
}

impl Command for Get {
    fn name(&self) -> &'static str {
        "get"
    }

    fn arity(&self) -> i32 {
        2
    }

    fn key_spec(&self) -> KeySpec {
        KeySpec {
            first: 1,
            last: 1,
            step: 1,
        }
    }

    fn run(&self, sess: &Session, args: &[String]) -> Result<BytesFrame, CommandError> {
        let server = sess.server();
        let key = args[1].as_bytes();
        let shard = server.shards().shard_for_key(key);
        let _lock = server.shards().lock(shard, LockMode::IntentShared)?;
        let store = server
            .shards()
            .get(shard)
            .expect("store missing for routed shard");
        let txn = store.begin()?;
        match txn.get(key)? {
            Some(value) => Ok(BytesFrame::BulkString(Bytes::from(value))),
            None => Ok(BytesFrame::Null),
        }
    }
}

register_command!(Get);

/// Write one key to its owning shard.
pub struct Set;

impl Set {
    pub const fn new() -> Self {
        Self
    }
}

impl Command for Set {
    fn name(&self) -> &'static str {
        "set"
    }

    fn arity(&self) -> i32 {
        3
    }

    fn key_spec(&self) -> KeySpec {
        KeySpec {
            first: 1,
            last: 1,
            step: 1,
        }
    }

    fn run(&self, sess: &Session, args: &[String]) -> Result<BytesFrame, CommandError> {
        let server = sess.server();
        let key = args[1].as_bytes();
        let shard = server.shards().shard_for_key(key);
        let _lock = server.shards().lock(shard, LockMode::Exclusive)?;
        let store = server
            .shards()
            .get(shard)
            .expect("store missing for routed shard");
        let mut txn = store.begin()?;
        txn.put(key.to_vec(), args[2].clone().into_bytes());
        if let Some(txn_id) = txn.commit()? {
            server.repl().observe_commit(shard, txn_id);
        }
        Ok(ok_frame())
    }
}

register_command!(Set);
