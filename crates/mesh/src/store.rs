//! Local persistence for trust history and blacklist cooldowns.
//!
//! Both tables are plain key/value records with a timestamp, stored in
//! SQLite so they survive a process restart. No key material is ever written
//! here.

use crate::error::MeshResult;
use crate::registry::TrustChange;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use swarmlink_core::{NodeId, Timestamp};

/// One persisted trust sample.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustRecord {
    /// Node the score belongs to
    pub node_id: NodeId,
    /// Trust score after the change
    pub score: f64,
    /// Time of the change
    pub timestamp: Timestamp,
}

/// SQLite-backed store.
#[derive(Debug)]
pub struct LinkStore {
    db: Mutex<Connection>,
}

impl LinkStore {
    /// Open (or create) a store at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> MeshResult<Self> {
        Self::init(Connection::open(db_path)?)
    }

    /// In-memory store for simulations and tests.
    pub fn in_memory() -> MeshResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> MeshResult<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS trust_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                score REAL NOT NULL,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS cooldowns (
                key TEXT PRIMARY KEY,
                until_ms INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_trust_node ON trust_history(node_id, timestamp)",
            [],
        )?;

        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a trust change.
    pub fn record_trust(&self, change: &TrustChange) -> MeshResult<()> {
        self.conn().execute(
            "INSERT INTO trust_history (node_id, score, timestamp) VALUES (?1, ?2, ?3)",
            params![change.node_id, change.current, change.timestamp as i64],
        )?;
        Ok(())
    }

    /// Latest persisted trust per node.
    pub fn latest_trust(&self) -> MeshResult<HashMap<NodeId, f64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT node_id, score FROM trust_history t
             WHERE id = (SELECT MAX(id) FROM trust_history WHERE node_id = t.node_id)",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    /// Full trust history of one node, oldest first.
    pub fn trust_history(&self, node_id: &str) -> MeshResult<Vec<TrustRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT node_id, score, timestamp FROM trust_history WHERE node_id = ?1 ORDER BY id",
        )?;
        let records = stmt
            .query_map([node_id], |row| {
                Ok(TrustRecord {
                    node_id: row.get(0)?,
                    score: row.get(1)?,
                    timestamp: row.get::<_, i64>(2)?.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Set or extend a cooldown.
    pub fn set_cooldown(&self, key: &str, until_ms: Timestamp, now: Timestamp) -> MeshResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO cooldowns (key, until_ms, timestamp) VALUES (?1, ?2, ?3)",
            params![key, until_ms as i64, now as i64],
        )?;
        Ok(())
    }

    /// Expiry of a cooldown still in force at `now`.
    pub fn cooldown(&self, key: &str, now: Timestamp) -> MeshResult<Option<Timestamp>> {
        let until: Option<i64> = self
            .conn()
            .query_row(
                "SELECT until_ms FROM cooldowns WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(until
            .map(|u| u.max(0) as u64)
            .filter(|&until| until > now))
    }

    /// Every cooldown still in force at `now`.
    pub fn active_cooldowns(&self, now: Timestamp) -> MeshResult<Vec<(String, Timestamp)>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT key, until_ms FROM cooldowns WHERE until_ms > ?1 ORDER BY key")?;
        let rows = stmt
            .query_map([now as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove cooldowns that ended before `now`.
    pub fn prune_cooldowns(&self, now: Timestamp) -> MeshResult<usize> {
        Ok(self
            .conn()
            .execute("DELETE FROM cooldowns WHERE until_ms <= ?1", [now as i64])?)
    }
}
