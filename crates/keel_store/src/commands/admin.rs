//! Administrative and diagnostic commands.

use std::collections::BTreeSet;

use redis_protocol::resp2::types::BytesFrame;
use serde_json::{Map, Value};

use keel_engine::{LockMode, INSTANCE_NUM, MIN_VALID_TXNID};

use crate::command::{
    bulk_frame, lookup_store, ok_frame, register_command, registry, Command, CommandError,
};
use crate::session::Session;

/// Flip collection of per-command timing metrics.
pub struct ToggleFtmc;

impl ToggleFtmc {
    pub const fn new() -> Self {
        Self
    }
}

impl Command for ToggleFtmc {
    fn name(&self) -> &'static str {
        "toggleftmc"
    }

    fn arity(&self) -> i32 {
        2
    }

    fn run(&self, sess: &Session, args: &[String]) -> Result<BytesFrame, CommandError> {
        let enable = match args[1].as_str() {
            "1" => true,
            "0" => false,
            _ => return Err(CommandError::parse("invalid toggleftmc para")),
        };
        sess.server().toggle_ftmc(enable);
        Ok(ok_frame())
    }
}

register_command!(ToggleFtmc);

/// Enumerate every registered command name.
pub struct CommandList;

impl CommandList {
    pub const fn new() -> Self {
        Self
    }
}

impl Command for CommandList {
    fn name(&self) -> &'static str {
        "commandlist"
    }

    fn arity(&self) -> i32 {
        1
    }

    fn run(&self, _sess: &Session, _args: &[String]) -> Result<BytesFrame, CommandError> {
        let names = registry()
            .iter()
            .map(|cmd| bulk_frame(cmd.name()))
            .collect();
        Ok(BytesFrame::Array(names))
    }
}

register_command!(CommandList);

/// Report the txn id of a shard's newest binlog entry.
pub struct BinlogPos;

impl BinlogPos {
    pub const fn new() -> Self {
        Self
    }
}

impl Command for BinlogPos {
    fn name(&self) -> &'static str {
        "binlogpos"
    }

    fn arity(&self) -> i32 {
        -2
    }

    fn run(&self, sess: &Session, args: &[String]) -> Result<BytesFrame, CommandError> {
        let server = sess.server();
        let (_lock, store) = lookup_store(&server, &args[1], LockMode::IntentShared)?;
        // Read-only: the transaction exists solely to scope the cursor.
        let txn = store.begin()?;
        let mut cursor = txn.binlog_cursor(MIN_VALID_TXNID)?;
        cursor.seek_to_last();
        let entry = cursor.next()?;
        Ok(BytesFrame::Integer(entry.txn_id as i64))
    }
}

register_command!(BinlogPos);

/// Structured health/statistics snapshot across subsystems.
pub struct DebugCommand;

impl DebugCommand {
    pub const fn new() -> Self {
        Self
    }
}

impl Command for DebugCommand {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn arity(&self) -> i32 {
        -1
    }

    fn run(&self, sess: &Session, args: &[String]) -> Result<BytesFrame, CommandError> {
        let mut sections: BTreeSet<String> = BTreeSet::new();
        if args.len() == 1 {
            for section in ["stores", "repl", "sessions"] {
                sections.insert(section.to_string());
            }
        } else {
            for arg in &args[1..] {
                sections.insert(arg.to_ascii_lowercase());
            }
        }

        let server = sess.server();
        let mut root = Map::new();
        if sections.contains("stores") {
            let mut stores = Map::new();
            for shard in 0..INSTANCE_NUM {
                // Best-effort snapshot; no shard lock is taken here.
                let store = server
                    .shards()
                    .get(shard)
                    .expect("store missing for configured shard");
                let mut obj = Map::new();
                store.append_stats(&mut obj);
                stores.insert(format!("Stores_{shard}"), Value::Object(obj));
            }
            root.insert("Stores".to_string(), Value::Object(stores));
        }
        if sections.contains("repl") {
            let mut obj = Map::new();
            server.repl().append_stats(&mut obj);
            root.insert("repl".to_string(), Value::Object(obj));
        }
        if sections.contains("sessions") {
            let mut obj = Map::new();
            server.sessions().append_session_stats(&mut obj);
            root.insert("Sessions".to_string(), Value::Object(obj));
        }

        let text = serde_json::to_string_pretty(&Value::Object(root))
            .map_err(|err| CommandError::internal(err.to_string()))?;
        Ok(bulk_frame(text))
    }
}

register_command!(DebugCommand);
