//! In-memory session registry with identity migration and optional
//! write-through SQLite persistence.

use std::sync::Mutex;

use dashmap::DashMap;
use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};

use crate::db;
use crate::error::Result;

/// One known CLI session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// The UUID the CLI files this conversation under.
    pub uuid: String,
    /// Canonical identity for cross-key migration, when known.
    pub identity: Option<String>,
    /// Unix seconds of the last successful run. Drives optional TTL.
    pub last_used: i64,
}

/// Maps session keys to CLI sessions.
///
/// All mutation happens on the HTTP/child-close path; the DashMap tolerates
/// concurrent additions of unrelated keys. The optional SQLite store is a
/// write-through mirror behind a `Mutex<Connection>`, loaded once at startup.
pub struct SessionRegistry {
    entries: DashMap<String, SessionRecord>,
    store: Option<Mutex<Connection>>,
    ttl_secs: Option<u64>,
}

impl SessionRegistry {
    /// Open the registry, loading persisted rows when a store path is set.
    pub fn open(store_path: Option<&str>, ttl_secs: Option<u64>) -> Result<Self> {
        let entries = DashMap::new();
        let store = match store_path {
            Some(path) => {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(path)?;
                db::init_db(&conn)?;
                let rows = db::load_all(&conn)?;
                info!(sessions = rows.len(), path, "session registry loaded");
                for (key, record) in rows {
                    entries.insert(key, record);
                }
                Some(Mutex::new(conn))
            }
            None => None,
        };
        Ok(Self {
            entries,
            store,
            ttl_secs,
        })
    }

    /// Memory-only registry (tests, ephemeral deployments).
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            store: None,
            ttl_secs: None,
        }
    }

    /// Exact-match lookup. Applies lazy TTL eviction when configured.
    #[instrument(skip(self))]
    pub fn lookup(&self, session_key: &str) -> Option<SessionRecord> {
        let record = self.entries.get(session_key)?.clone();
        if let Some(ttl) = self.ttl_secs {
            let age = now_secs().saturating_sub(record.last_used);
            if age as u64 > ttl {
                debug!(session_key, "session expired; evicting");
                self.remove(session_key);
                return None;
            }
        }
        Some(record)
    }

    /// Identity-based migration: when no exact match exists but another key
    /// carries the same non-empty identity, transfer that record to the new
    /// key and delete the old one. Never performed without an identity.
    #[instrument(skip(self))]
    pub fn migrate(&self, session_key: &str, identity: &str) -> Option<SessionRecord> {
        if identity.is_empty() {
            return None;
        }
        let old_key = self.entries.iter().find_map(|entry| {
            (entry.key() != session_key && entry.value().identity.as_deref() == Some(identity))
                .then(|| entry.key().clone())
        })?;
        let (_, record) = self.entries.remove(&old_key)?;
        info!(from = %old_key, to = %session_key, identity, "migrating session to new key");
        self.entries.insert(session_key.to_string(), record.clone());
        self.persist_delete(&old_key);
        self.persist(session_key, &record);
        Some(record)
    }

    /// Upsert a record with `last_used = now`.
    #[instrument(skip(self))]
    pub fn record(&self, session_key: &str, uuid: &str, identity: Option<&str>) {
        let record = SessionRecord {
            uuid: uuid.to_string(),
            identity: identity.map(String::from),
            last_used: now_secs(),
        };
        self.entries.insert(session_key.to_string(), record.clone());
        self.persist(session_key, &record);
    }

    /// Drop a record (failed resume recovery).
    pub fn remove(&self, session_key: &str) {
        self.entries.remove(session_key);
        self.persist_delete(session_key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self, key: &str, record: &SessionRecord) {
        if let Some(store) = &self.store {
            let conn = store.lock().unwrap();
            if let Err(e) = db::upsert_row(&conn, key, record) {
                warn!(key, error = %e, "failed to persist session record");
            }
        }
    }

    fn persist_delete(&self, key: &str) {
        if let Some(store) = &self.store {
            let conn = store.lock().unwrap();
            if let Err(e) = db::delete_row(&conn, key) {
                warn!(key, error = %e, "failed to delete persisted session record");
            }
        }
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
