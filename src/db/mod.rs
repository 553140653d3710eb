pub mod schema;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const LAST_SYNC_KEY: &str = "last_successful_sync";

/// Database connection shared by the cache storage and the mutation queue
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the default location
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("dreamsw").join("dreamsw.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection.
  ///
  /// Every statement runs to completion under the lock, so a panic while it is
  /// held cannot leave a half-written row behind and the poison can be ignored.
  pub fn conn(&self) -> MutexGuard<'_, Connection> {
    self
      .conn
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Read a value from the key/value state table
  pub fn get_state(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()
      .query_row(
        "SELECT value FROM sync_state WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read state '{}': {}", key, e))
  }

  pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()
      .execute(
        "INSERT OR REPLACE INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)",
        params![key, value, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to write state '{}': {}", key, e))?;
    Ok(())
  }

  /// Record when the engine last synced successfully with the origin
  pub fn record_sync(&self, at: DateTime<Utc>) -> Result<()> {
    self.set_state(LAST_SYNC_KEY, &at.to_rfc3339())
  }

  pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
    self
      .get_state(LAST_SYNC_KEY)?
      .as_deref()
      .map(parse_datetime)
      .transpose()
  }
}

/// Parse an RFC 3339 timestamp as stored by this crate.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
