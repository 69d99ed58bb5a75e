//! SQLite-backed storage for cache generations, sync tasks and lifecycle state.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStorage, CachedEntry, RequestKey};
use crate::lifecycle::StateStore;
use crate::sync::{SyncTask, SyncTaskStore};

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Private in-memory database, used by tests and throwaway runs.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }
}

const SCHEMA: &str = r#"
-- Named cache generations
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

-- Stored responses, one per (generation, request key)
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (cache_name, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(key_hash, stored_at);

-- Background sync queue
CREATE TABLE IF NOT EXISTS sync_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    payload TEXT NOT NULL,
    body BLOB,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_tasks_tag ON sync_tasks(tag, id);

-- Lifecycle bookkeeping
CREATE TABLE IF NOT EXISTS worker_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const SELECT_ENTRY: &str =
  "SELECT status, status_text, headers, body, stored_at FROM cache_entries";

fn ensure_generation(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?, ?)",
      params![name, Utc::now().timestamp_millis()],
    )
    .map_err(|e| eyre!("Failed to create cache generation {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, name: &str, key: &RequestKey, entry: &CachedEntry) -> Result<()> {
  if !key.is_cacheable() {
    return Err(eyre!(
      "Refusing to cache {} {}: only GET responses are cached",
      key.method,
      key.url
    ));
  }

  let headers =
    serde_json::to_string(&entry.headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, key_hash, method, url, status, status_text, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        name,
        key.cache_hash(),
        key.method.as_str(),
        key.url.as_str(),
        entry.status,
        entry.status_text,
        headers,
        entry.body,
        entry.stored_at.timestamp_millis(),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry for {}: {}", key.url, e))?;
  Ok(())
}

type EntryRow = (u16, String, String, Vec<u8>, i64);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_entry((status, status_text, headers, body, stored_at): EntryRow) -> Result<CachedEntry> {
  let headers = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
  Ok(CachedEntry {
    status,
    status_text,
    headers,
    body,
    stored_at: from_millis(stored_at)?,
  })
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(millis)
    .single()
    .ok_or_else(|| eyre!("Invalid timestamp in cache database: {}", millis))
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_generation(&conn, name)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache generation: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  fn put(&self, name: &str, key: &RequestKey, entry: &CachedEntry) -> Result<()> {
    self.put_all(name, std::slice::from_ref(&(key.clone(), entry.clone())))
  }

  fn put_all(&self, name: &str, entries: &[(RequestKey, CachedEntry)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_generation(&tx, name)?;
    for (key, entry) in entries {
      insert_entry(&tx, name, key, entry)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        &format!("{} WHERE cache_name = ? AND key_hash = ?", SELECT_ENTRY),
        params![name, key.cache_hash()],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row.map(into_entry).transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        &format!(
          "{} WHERE key_hash = ? ORDER BY stored_at DESC, rowid DESC LIMIT 1",
          SELECT_ENTRY
        ),
        params![key.cache_hash()],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row.map(into_entry).transpose()
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))
  }
}

impl SyncTaskStore for SqliteStorage {
  fn push(&self, task: &SyncTask) -> Result<i64> {
    let conn = self.lock()?;
    let payload = serde_json::to_string(&task.payload)
      .map_err(|e| eyre!("Failed to serialize sync payload: {}", e))?;
    let headers = serde_json::to_string(&task.headers)
      .map_err(|e| eyre!("Failed to serialize sync headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_tasks (tag, method, url, headers, payload, body, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          task.tag,
          task.method,
          task.url,
          headers,
          payload,
          task.body,
          task.created_at.timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to queue sync task: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn list(&self, tag: &str) -> Result<Vec<SyncTask>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, tag, method, url, headers, payload, body, created_at FROM sync_tasks
         WHERE tag = ? ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![tag], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
          row.get::<_, Option<Vec<u8>>>(6)?,
          row.get::<_, i64>(7)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query sync tasks: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync task: {}", e))?;

    rows
      .into_iter()
      .map(|(id, tag, method, url, headers, payload, body, created_at)| {
        Ok(SyncTask {
          id,
          tag,
          method,
          url,
          headers: serde_json::from_str(&headers)
            .map_err(|e| eyre!("Failed to deserialize sync task {} headers: {}", id, e))?,
          payload: serde_json::from_str(&payload)
            .map_err(|e| eyre!("Failed to deserialize sync task {}: {}", id, e))?,
          body,
          created_at: from_millis(created_at)?,
        })
      })
      .collect()
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM sync_tasks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync task {}: {}", id, e))?;
    Ok(())
  }

  fn clear(&self, tag: &str, through: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM sync_tasks WHERE tag = ? AND id <= ?",
        params![tag, through],
      )
      .map_err(|e| eyre!("Failed to clear sync tasks: {}", e))?;
    Ok(())
  }
}

impl StateStore for SqliteStorage {
  fn get_state(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM worker_state WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read worker state {}: {}", key, e))
  }

  fn set_state(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO worker_state (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write worker state {}: {}", key, e))?;
    Ok(())
  }

  fn clear_state(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM worker_state WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to clear worker state {}: {}", key, e))?;
    Ok(())
  }
}
