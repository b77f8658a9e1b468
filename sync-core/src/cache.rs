//! Durable per-key cache.
//!
//! Two implementations:
//! - **`SqliteCache`**: single-table SQLite file, survives restarts.
//! - **`MemoryCache`**: process-local map, used in tests and as the fallback
//!   when the SQLite file cannot be opened.
//!
//! The contract is best-effort: `set` and `remove` never fail from the
//! caller's point of view. Storage errors (quota, I/O, corruption) are logged
//! and the system keeps running from in-memory state.
//!
//! ## Key Layout
//!
//! ```text
//! huddle.{namespace}                      legacy, pre-tenant value
//! huddle.{namespace}:{tenant}             one value per domain per tenant
//! huddle.{namespace}:{tenant}:{board}     task-order overlay per board
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::BoardId;
use crate::model::TenantId;

/// Errors from opening a cache. Reads and writes never surface errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Logical cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    const PREFIX: &'static str = "huddle";

    /// Pre-tenant key kept only for one-time migration.
    pub fn legacy(namespace: &str) -> Self {
        Self(format!("{}.{namespace}", Self::PREFIX))
    }

    pub fn tenant(namespace: &str, tenant: &TenantId) -> Self {
        Self(format!("{}.{namespace}:{tenant}", Self::PREFIX))
    }

    pub fn board(namespace: &str, tenant: &TenantId, board: &BoardId) -> Self {
        Self(format!("{}.{namespace}:{tenant}:{board}", Self::PREFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Synchronous, best-effort key-value store.
pub trait DurableCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>>;

    fn set(&self, key: &CacheKey, value: &[u8]);

    fn remove(&self, key: &CacheKey);
}

/// Read and decode a JSON value. Undecodable entries read as absent.
pub fn read_json<T: DeserializeOwned>(cache: &dyn DurableCache, key: &CacheKey) -> Option<T> {
    let bytes = cache.get(key)?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Discarding undecodable cache entry {key}: {e}");
            None
        }
    }
}

/// Encode and write a JSON value.
pub fn write_json<T: Serialize>(cache: &dyn DurableCache, key: &CacheKey, value: &T) {
    match serde_json::to_vec(value) {
        Ok(bytes) => cache.set(key, &bytes),
        Err(e) => tracing::warn!("Failed to encode cache entry {key}: {e}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed cache.
pub struct SqliteCache {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteCache {
    /// Open (or create) the cache file at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Non-durable SQLite database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, CacheError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_cache (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DurableCache for SqliteCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let result = self
            .conn()
            .query_row(
                "SELECT value FROM kv_cache WHERE key = ?1",
                params![key.as_str()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional();
        match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Cache read {key} failed: {e}");
                None
            }
        }
    }

    fn set(&self, key: &CacheKey, value: &[u8]) {
        let now = chrono::Utc::now().to_rfc3339();
        let result = self.conn().execute(
            "INSERT INTO kv_cache (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key.as_str(), value, now],
        );
        if let Err(e) = result {
            tracing::warn!("Cache write {key} failed, continuing without durability: {e}");
        }
    }

    fn remove(&self, key: &CacheKey) {
        if let Err(e) = self
            .conn()
            .execute("DELETE FROM kv_cache WHERE key = ?1", params![key.as_str()])
        {
            tracing::warn!("Cache delete {key} failed: {e}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// Process-local cache with an optional byte quota.
///
/// Writes that would exceed the quota are dropped, the same way a browser
/// storage quota error is swallowed.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    quota_bytes: Option<usize>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.entries().get(key.as_str()).cloned()
    }

    fn set(&self, key: &CacheKey, value: &[u8]) {
        let mut entries = self.entries();
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key.as_str())
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.as_str().len() + value.len() > quota {
                tracing::warn!("Cache quota exceeded writing {key}; keeping in-memory state only");
                return;
            }
        }
        entries.insert(key.as_str().to_string(), value.to_vec());
    }

    fn remove(&self, key: &CacheKey) {
        self.entries().remove(key.as_str());
    }
}

/// Open the SQLite cache at `path`, degrading to an in-memory cache when the
/// file cannot be opened.
pub fn open_or_fallback(path: &Path) -> Arc<dyn DurableCache> {
    match SqliteCache::open(path) {
        Ok(cache) => {
            tracing::debug!("Durable cache at {}", path.display());
            Arc::new(cache)
        }
        Err(e) => {
            tracing::warn!(
                "Durable cache unavailable at {}: {e}; running remote-only",
                path.display()
            );
            Arc::new(MemoryCache::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn key_layout() {
        let tenant = TenantId::new("h1");
        assert_eq!(CacheKey::legacy("scopes").as_str(), "huddle.scopes");
        assert_eq!(CacheKey::tenant("scopes", &tenant).as_str(), "huddle.scopes:h1");
        assert_eq!(
            CacheKey::board("task-order", &tenant, &BoardId::new("b1")).as_str(),
            "huddle.task-order:h1:b1"
        );
    }

    #[test]
    fn sqlite_survives_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("cache.sqlite3");
        let key = CacheKey::tenant("inbox.items", &TenantId::new("h1"));

        {
            let cache = SqliteCache::open(&path).unwrap();
            cache.set(&key, b"first");
            cache.set(&key, b"second");
        }

        let cache = SqliteCache::open(&path).unwrap();
        assert_eq!(cache.get(&key), Some(b"second".to_vec()));
        assert_eq!(cache.path(), Some(path.as_path()));

        cache.remove(&key);
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn quota_failures_are_swallowed() {
        let cache = MemoryCache::with_quota(32);
        let small = CacheKey::legacy("a");
        let big = CacheKey::legacy("b");

        cache.set(&small, b"ok");
        cache.set(&big, &[0u8; 64]);

        assert_eq!(cache.get(&small), Some(b"ok".to_vec()));
        assert_eq!(cache.get(&big), None);
    }

    #[test]
    fn undecodable_json_reads_as_absent() {
        let cache = MemoryCache::new();
        let key = CacheKey::legacy("timeline");
        cache.set(&key, b"{not json");
        assert_eq!(read_json::<serde_json::Value>(&cache, &key), None);

        write_json(&cache, &key, &serde_json::json!({"ok": true}));
        assert_eq!(
            read_json::<serde_json::Value>(&cache, &key),
            Some(serde_json::json!({"ok": true}))
        );
    }

    #[test]
    fn unopenable_path_falls_back_to_memory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        // A path whose parent is a regular file cannot be created.
        let cache = open_or_fallback(&blocker.join("cache.sqlite3"));
        let key = CacheKey::legacy("scopes");
        cache.set(&key, b"v");
        assert_eq!(cache.get(&key), Some(b"v".to_vec()));
    }
}
