//! spirereg persistence: the last observed entry per manifest key, in
//! SQLite. Small, synchronous and predictable; the CLI is not latency
//! sensitive here.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use spirereg_core::RegistrationEntry;
use tracing::debug;

/// Rows kept per key; older observations are pruned on write.
pub const KEEP_PER_KEY: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    /// Manifest key the entry is managed under.
    pub key: String,
    pub entry_id: String,
    pub revision: i64,
    pub ts: i64,
    pub entry: RegistrationEntry,
}

impl Observed {
    /// Build a record from an entry the server has acknowledged. Returns
    /// `None` for entries without a server id.
    pub fn of(key: impl Into<String>, entry: &RegistrationEntry) -> Option<Self> {
        let entry_id = entry.entry_id.clone()?;
        Some(Self { key: key.into(), entry_id, revision: entry.revision_number, ts: now_ts(), entry: entry.clone() })
    }
}

pub trait StateStore {
    fn put(&self, obs: &Observed) -> Result<()>;
    /// Newest observation for `key`.
    fn latest(&self, key: &str) -> Result<Option<Observed>>;
    /// Newest first, at most `limit` (default [`KEEP_PER_KEY`]).
    fn history(&self, key: &str, limit: Option<usize>) -> Result<Vec<Observed>>;
    /// Drop every row for `key`; returns the number removed.
    fn forget(&self, key: &str) -> Result<usize>;
    /// All keys with at least one observation, sorted.
    fn keys(&self) -> Result<Vec<String>>;
}

pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("SPIREREG_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS observed (
                key        TEXT NOT NULL,
                entry_id   TEXT NOT NULL,
                revision   INTEGER NOT NULL,
                ts         INTEGER NOT NULL,
                entry_json TEXT NOT NULL
            )",
            [],
        )
        .context("creating observed table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_observed_key_ts ON observed(key, ts DESC)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "state store open");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("state store lock poisoned"))
    }
}

impl StateStore for SqliteStore {
    fn put(&self, obs: &Observed) -> Result<()> {
        let started = Instant::now();
        let json = serde_json::to_string(&obs.entry).context("encoding entry")?;
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO observed(key, entry_id, revision, ts, entry_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&obs.key, &obs.entry_id, obs.revision, obs.ts, &json),
        )?;
        tx.execute(
            "DELETE FROM observed
             WHERE key = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM observed WHERE key = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&obs.key, KEEP_PER_KEY as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn latest(&self, key: &str) -> Result<Option<Observed>> { Ok(self.history(key, Some(1))?.into_iter().next()) }

    fn history(&self, key: &str, limit: Option<usize>) -> Result<Vec<Observed>> {
        let started = Instant::now();
        let cap = limit.unwrap_or(KEEP_PER_KEY);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT entry_id, revision, ts, entry_json FROM observed WHERE key = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((key, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let entry_id: String = row.get(0)?;
            let revision: i64 = row.get(1)?;
            let ts: i64 = row.get(2)?;
            let json: String = row.get(3)?;
            let entry: RegistrationEntry =
                serde_json::from_str(&json).with_context(|| format!("decoding stored entry for {}", key))?;
            out.push(Observed { key: key.to_string(), entry_id, revision, ts, entry });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn forget(&self, key: &str) -> Result<usize> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM observed WHERE key = ?1", [key])?;
        counter!("persist_forget_total", 1u64);
        Ok(n)
    }

    fn keys(&self) -> Result<Vec<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT DISTINCT key FROM observed ORDER BY key")?;
        let keys = stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".spirereg");
        let _ = std::fs::create_dir_all(&p);
        p.push("state.db");
        return p.to_string_lossy().to_string();
    }
    "spirereg-state.db".to_string()
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
