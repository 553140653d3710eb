//! Cache storage trait and SQLite implementation.

use chrono::Utc;
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::sync::Arc;
use thiserror::Error;

use super::types::StoredResponse;
use crate::db::{parse_datetime, Database};
use crate::http::{Headers, Method, RequestKey};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("storage quota exceeded")]
  QuotaExceeded,

  #[error("sqlite error: {0}")]
  Sqlite(rusqlite::Error),

  #[error("corrupt cache entry: {0}")]
  Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
  fn from(err: rusqlite::Error) -> Self {
    match &err {
      rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DiskFull => Self::QuotaExceeded,
      _ => Self::Sqlite(err),
    }
  }
}

/// Entry count and body size of a namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceUsage {
  pub entries: u64,
  pub bytes: u64,
}

/// Trait for cache storage backends.
///
/// Each method is atomic on its own: an entry is either fully written or not
/// at all, and deleting a namespace removes all of its entries together.
pub trait CacheStorage: Send + Sync {
  /// Create a namespace. Returns false if it already existed.
  fn create_namespace(&self, name: &str) -> Result<bool, StoreError>;

  /// All namespaces in creation order.
  fn namespaces(&self) -> Result<Vec<String>, StoreError>;

  /// Delete a namespace and its entries. Returns false if it did not exist.
  fn delete_namespace(&self, name: &str) -> Result<bool, StoreError>;

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<StoredResponse>, StoreError>;

  /// Insert or replace an entry, creating the namespace if needed.
  fn put(
    &self,
    namespace: &str,
    key: &RequestKey,
    response: &StoredResponse,
  ) -> Result<(), StoreError>;

  /// Keys of a namespace in insertion order.
  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, StoreError>;

  fn usage(&self, namespace: &str) -> Result<NamespaceUsage, StoreError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
  /// Upper bound on the sum of stored body sizes across namespaces
  max_bytes: Option<u64>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self {
      db,
      max_bytes: None,
    }
  }

  pub fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
    self.max_bytes = max_bytes;
    self
  }
}

impl CacheStorage for SqliteStorage {
  fn create_namespace(&self, name: &str) -> Result<bool, StoreError> {
    let changed = self.db.conn().execute(
      "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
      params![name, Utc::now().to_rfc3339()],
    )?;
    Ok(changed > 0)
  }

  fn namespaces(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.db.conn();
    let mut stmt = conn.prepare("SELECT name FROM cache_namespaces ORDER BY created_at, rowid")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool, StoreError> {
    let mut conn = self.db.conn();
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM cache_entries WHERE namespace = ?", params![name])?;
    let deleted = tx.execute("DELETE FROM cache_namespaces WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(deleted > 0)
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<StoredResponse>, StoreError> {
    let conn = self.db.conn();
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE namespace = ? AND key_hash = ?",
        params![namespace, key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| StoreError::Corrupt(format!("headers of {}: {}", key, e)))?;
        let stored_at = parse_datetime(&stored_at)
          .map_err(|e| StoreError::Corrupt(format!("timestamp of {}: {}", key, e)))?;
        Ok(Some(StoredResponse {
          status,
          headers,
          body: body.into(),
          stored_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(
    &self,
    namespace: &str,
    key: &RequestKey,
    response: &StoredResponse,
  ) -> Result<(), StoreError> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| StoreError::Corrupt(format!("headers of {}: {}", key, e)))?;
    let digest = key.digest();

    let mut conn = self.db.conn();
    let tx = conn.transaction()?;

    if let Some(limit) = self.max_bytes {
      // Bytes held by everything except the entry being replaced
      let used: i64 = tx.query_row(
        "SELECT COALESCE(SUM(LENGTH(body)), 0) FROM cache_entries
         WHERE NOT (namespace = ? AND key_hash = ?)",
        params![namespace, digest],
        |row| row.get(0),
      )?;
      if used as u64 + response.body.len() as u64 > limit {
        return Err(StoreError::QuotaExceeded);
      }
    }

    tx.execute(
      "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?, ?)",
      params![namespace, Utc::now().to_rfc3339()],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (namespace, key_hash, method, url, status, headers, body, stored_at, seq)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
         (SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries WHERE namespace = ?1))",
      params![
        namespace,
        digest,
        key.method.as_str(),
        key.url,
        response.status,
        headers,
        response.body.as_ref(),
        response.stored_at.to_rfc3339(),
      ],
    )?;
    tx.commit()?;

    Ok(())
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, StoreError> {
    let conn = self.db.conn();
    let mut stmt =
      conn.prepare("SELECT method, url FROM cache_entries WHERE namespace = ? ORDER BY seq")?;
    let rows = stmt
      .query_map(params![namespace], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(method, url)| {
        let method: Method = method.parse().map_err(StoreError::Corrupt)?;
        Ok(RequestKey { method, url })
      })
      .collect()
  }

  fn usage(&self, namespace: &str) -> Result<NamespaceUsage, StoreError> {
    let (entries, bytes): (i64, i64) = self.db.conn().query_row(
      "SELECT COUNT(*), COALESCE(SUM(LENGTH(body)), 0) FROM cache_entries WHERE namespace = ?",
      params![namespace],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(NamespaceUsage {
      entries: entries as u64,
      bytes: bytes as u64,
    })
  }
}
