//! Per-connection session bookkeeping for diagnostics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::server::ServerEntry;

/// One client connection's context, tracked for diagnostics.
pub struct Session {
    id: u64,
    peer: String,
    connected_ms: u64,
    commands: AtomicU64,
    latency_us: AtomicU64,
    last_command: RwLock<String>,
    server: Weak<ServerEntry>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server handle backing this session.
    ///
    /// A session outliving its server is a broken startup/shutdown
    /// contract; fail fast rather than returning a recoverable error.
    pub fn server(&self) -> Arc<ServerEntry> {
        self.server
            .upgrade()
            .expect("server entry dropped while session is live")
    }

    /// Record one executed command; latency is present only while the
    /// telemetry toggle is on.
    pub fn note_command(&self, name: &str, elapsed_us: Option<u64>) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if let Some(us) = elapsed_us {
            self.latency_us.fetch_add(us, Ordering::Relaxed);
        }
        if let Ok(mut last) = self.last_command.write() {
            last.clear();
            last.push_str(name);
        }
    }
}

/// Registry of live sessions, keyed by monotonic session id.
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: RwLock<BTreeMap<u64, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, server: &Arc<ServerEntry>, peer: String) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session {
            id,
            peer,
            connected_ms: unix_time_ms(),
            commands: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            last_command: RwLock::new(String::new()),
            server: Arc::downgrade(server),
        });
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(id, session.clone());
        }
        session
    }

    pub fn deregister(&self, id: u64) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(&id);
        }
    }

    /// Self-reported per-session statistics fragment.
    pub fn append_session_stats(&self, out: &mut Map<String, Value>) {
        let Ok(sessions) = self.sessions.read() else {
            return;
        };
        for (id, sess) in sessions.iter() {
            let mut obj = Map::new();
            obj.insert("peer".to_string(), sess.peer.clone().into());
            obj.insert("connected_ms".to_string(), sess.connected_ms.into());
            obj.insert(
                "commands".to_string(),
                sess.commands.load(Ordering::Relaxed).into(),
            );
            obj.insert(
                "latency_us".to_string(),
                sess.latency_us.load(Ordering::Relaxed).into(),
            );
            let last = sess
                .last_command
                .read()
                .map(|s| s.clone())
                .unwrap_or_default();
            obj.insert("last_command".to_string(), last.into());
            out.insert(format!("sess_{id}"), Value::Object(obj));
        }
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
