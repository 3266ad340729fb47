use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

/// Byte-oriented key/value cache shared by the resolver and the handle directory.
pub trait KvCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// The process-wide SQLite database. Opened once at start-up and closed on exit.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = match opts.path {
            Some(path) => path,
            None => default_path().ok_or_else(|| {
                Error::local_state("storage: resolve default path", "no cache directory")
            })?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::local_state(format!("storage: create directory {}", parent.display()), err)
            })?;
        }

        let conn = Connection::open(&path).map_err(|err| {
            Error::local_state(format!("storage: open database at {}", path.display()), err)
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| Error::local_state("storage: set WAL", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| Error::local_state("storage: set busy timeout", err))?;
        migrate(&conn).map_err(|err| Error::local_state("storage: migrate", err))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| Error::local_state("storage: close", "connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| Error::local_state("storage: close connection", err))
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))
            .map_err(|err| Error::local_state("storage: count entries", err))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl KvCache for Store {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| Error::local_state(format!("storage: get {key}"), err))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO kv (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value,
  updated_at = excluded.updated_at
"#,
            params![key, value, Utc::now().timestamp()],
        )
        .map_err(|err| Error::local_state(format!("storage: set {key}"), err))?;
        Ok(())
    }
}

/// In-process cache for commands that never touch the database, and for tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
    }
    Ok(())
}

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value BLOB NOT NULL,
  updated_at INTEGER NOT NULL
);
"#];

pub fn default_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("lemon3").join("cache.db"))
}
