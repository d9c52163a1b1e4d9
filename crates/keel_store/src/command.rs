//! Command descriptors, the process-wide registry, and dispatch.
//!
//! Commands self-register at link time; the registry is assembled once on
//! first use and is immutable afterwards, so lookups need no
//! synchronization.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;
use thiserror::Error;

use keel_engine::{EngineError, LockMode, Store, StoreLock, INSTANCE_NUM};

use crate::server::ServerEntry;
use crate::session::Session;

/// Error classes surfaced to operators as `-<TAG> <message>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Argument validation failed before any lock or transaction.
    ParseOpt,
    /// A cursor ran out of entries (e.g. an empty binlog).
    Exhausted,
    /// The storage engine rejected or failed an operation.
    Storage,
    /// A failure inside this layer that is not the caller's fault.
    Internal,
}

impl ErrorKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::ParseOpt => "PARSEOPT",
            ErrorKind::Exhausted => "EXHAUST",
            ErrorKind::Storage => "STORAGE",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// A typed command failure: kind tag plus operator-readable message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CommandError {
    kind: ErrorKind,
    message: String,
}

impl CommandError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ParseOpt,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn to_frame(&self) -> BytesFrame {
        BytesFrame::Error(format!("{} {}", self.kind.tag(), self.message).into())
    }
}

impl From<EngineError> for CommandError {
    fn from(err: EngineError) -> Self {
        let kind = match &err {
            EngineError::Exhausted(_) => ErrorKind::Exhausted,
            EngineError::Storage(_) | EngineError::Corrupt(_) => ErrorKind::Storage,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Key positions within an argument list, used for cluster key routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    pub first: i32,
    pub last: i32,
    pub step: i32,
}

impl KeySpec {
    /// A command that carries no keys.
    pub const NONE: KeySpec = KeySpec {
        first: 0,
        last: 0,
        step: 0,
    };

    /// Extract the arguments this spec marks as keys.
    pub fn keys<'a>(&self, args: &'a [String]) -> Vec<&'a str> {
        if self.first <= 0 || self.step <= 0 {
            return Vec::new();
        }
        let last = if self.last < 0 {
            args.len() as i32 + self.last
        } else {
            self.last
        };
        if last < self.first {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut idx = self.first as usize;
        while idx <= last as usize && idx < args.len() {
            out.push(args[idx].as_str());
            idx += self.step as usize;
        }
        out
    }
}

/// A dispatchable operator command.
pub trait Command: Send + Sync + 'static {
    /// Registry name; unique and lowercase.
    fn name(&self) -> &'static str;

    /// Positive: exact token count including the name. Negative: at least
    /// `|arity|` tokens.
    fn arity(&self) -> i32;

    fn key_spec(&self) -> KeySpec {
        KeySpec::NONE
    }

    fn run(&self, sess: &Session, args: &[String]) -> Result<BytesFrame, CommandError>;
}

inventory::collect!(&'static dyn Command);

/// Register a command implementation with the process-wide registry.
macro_rules! register_command {
    ($ty:ty) => {
        inventory::submit! { &<$ty>::new() as &'static dyn $crate::command::Command }
    };
}
pub(crate) use register_command;

pub struct Registry {
    order: Vec<&'static dyn Command>,
    by_name: HashMap<&'static str, &'static dyn Command>,
}

impl Registry {
    fn build() -> Self {
        let mut order = Vec::new();
        let mut by_name = HashMap::new();
        for cmd in inventory::iter::<&'static dyn Command> {
            let prev = by_name.insert(cmd.name(), *cmd);
            assert!(prev.is_none(), "duplicate command name {}", cmd.name());
            order.push(*cmd);
        }
        Self { order, by_name }
    }

    pub fn lookup(&self, name: &str) -> Option<&'static dyn Command> {
        self.by_name.get(name).copied()
    }

    /// All commands in registration order, stable within a process run.
    pub fn iter(&self) -> impl Iterator<Item = &'static dyn Command> + '_ {
        self.order.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::build)
}

fn arity_matches(arity: i32, argc: usize) -> bool {
    if arity >= 0 {
        argc == arity as usize
    } else {
        argc >= arity.unsigned_abs() as usize
    }
}

/// Resolve and run one parsed command, mapping failures to error frames.
pub fn execute(sess: &Session, args: &[String]) -> BytesFrame {
    debug_assert!(!args.is_empty());
    let name = args[0].to_ascii_lowercase();
    let Some(cmd) = registry().lookup(name.as_str()) else {
        return CommandError::parse(format!("unknown command '{name}'")).to_frame();
    };
    if !arity_matches(cmd.arity(), args.len()) {
        return CommandError::parse(format!("wrong number of arguments for '{name}'")).to_frame();
    }
    let keys = cmd.key_spec().keys(args);
    tracing::trace!(command = cmd.name(), keys = keys.len(), "dispatch");
    let started = Instant::now();
    let reply = match cmd.run(sess, args) {
        Ok(frame) => frame,
        Err(err) => err.to_frame(),
    };
    let elapsed_us = sess
        .server()
        .ftmc_enabled()
        .then(|| started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64);
    sess.note_command(cmd.name(), elapsed_us);
    reply
}

/// Parse and bound-check a shard index token, then take the requested lock
/// before resolving the store handle.
pub fn lookup_store<'a>(
    server: &'a ServerEntry,
    token: &str,
    mode: LockMode,
) -> Result<(StoreLock<'a>, Arc<Store>), CommandError> {
    let shard: u32 = token
        .parse()
        .map_err(|_| CommandError::parse(format!("invalid shard index '{token}'")))?;
    if shard >= INSTANCE_NUM {
        return Err(CommandError::parse(format!(
            "invalid instance num, must be < {INSTANCE_NUM}"
        )));
    }
    let lock = server.shards().lock(shard, mode)?;
    // The shard set is sized at startup; a validated index resolving to
    // nothing is a broken startup contract.
    let store = server
        .shards()
        .get(shard)
        .expect("store missing for validated shard index");
    Ok((lock, store))
}

pub fn ok_frame() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

pub fn bulk_frame(data: impl Into<Bytes>) -> BytesFrame {
    BytesFrame::BulkString(data.into())
}
