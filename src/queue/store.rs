//! Durable queue of deferred mutations.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::db::{parse_datetime, Database};
use crate::http::{Headers, Method, Request};

/// Lifecycle of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
  Pending,
  InFlight,
  /// Last replay failed; replayed again on the next trigger
  Failed,
  /// Replayed; the row is deleted together with this transition
  Done,
}

impl MutationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in_flight",
      Self::Failed => "failed",
      Self::Done => "done",
    }
  }
}

impl FromStr for MutationStatus {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "in_flight" => Ok(Self::InFlight),
      "failed" => Ok(Self::Failed),
      "done" => Ok(Self::Done),
      other => Err(eyre!("Unknown mutation status: {}", other)),
    }
  }
}

/// A request to be queued.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub url: Url,
  pub method: Method,
  pub headers: Headers,
  pub body: Option<Bytes>,
}

impl NewMutation {
  pub fn from_request(request: &Request) -> Self {
    Self {
      url: request.url.clone(),
      method: request.method,
      headers: request.headers.clone(),
      body: request.body.clone(),
    }
  }
}

/// A deferred mutation as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMutation {
  pub id: i64,
  pub url: String,
  pub method: Method,
  pub headers: Headers,
  #[serde(skip)]
  pub body: Option<Bytes>,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  pub status: MutationStatus,
  pub last_error: Option<String>,
}

impl QueuedMutation {
  /// Replays are grouped by endpoint to keep per-endpoint FIFO order.
  pub fn endpoint(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  pub fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid queued URL {}: {}", self.url, e))?;
    let mut request = Request::new(self.method, url);
    request.headers = self.headers.clone();
    request.body = self.body.clone();
    Ok(request)
  }

  fn from_row(row: &Row<'_>) -> rusqlite::Result<RawMutation> {
    Ok(RawMutation {
      id: row.get(0)?,
      url: row.get(1)?,
      method: row.get(2)?,
      headers: row.get(3)?,
      body: row.get(4)?,
      enqueued_at: row.get(5)?,
      retry_count: row.get(6)?,
      status: row.get(7)?,
      last_error: row.get(8)?,
    })
  }
}

/// Row as read from SQLite, before parsing the text columns.
struct RawMutation {
  id: i64,
  url: String,
  method: String,
  headers: String,
  body: Option<Vec<u8>>,
  enqueued_at: String,
  retry_count: u32,
  status: String,
  last_error: Option<String>,
}

impl RawMutation {
  fn parse(self) -> Result<QueuedMutation> {
    Ok(QueuedMutation {
      id: self.id,
      method: self
        .method
        .parse()
        .map_err(|e: String| eyre!("Mutation {}: {}", self.id, e))?,
      headers: serde_json::from_str(&self.headers)
        .map_err(|e| eyre!("Mutation {} has invalid headers: {}", self.id, e))?,
      body: self.body.map(Bytes::from),
      enqueued_at: parse_datetime(&self.enqueued_at)?,
      retry_count: self.retry_count,
      status: self.status.parse()?,
      last_error: self.last_error,
      url: self.url,
    })
  }
}

/// Number of queued mutations per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
  pub pending: u64,
  pub in_flight: u64,
  pub failed: u64,
}

const SELECT_COLUMNS: &str =
  "SELECT id, url, method, headers, body, enqueued_at, retry_count, status, last_error FROM mutation_queue";

/// Queue of mutations waiting for connectivity.
///
/// The only writer of `mutation_queue`. Ids come from SQLite AUTOINCREMENT and
/// are therefore strictly increasing in insertion order.
pub struct MutationQueue {
  db: Arc<Database>,
}

impl MutationQueue {
  /// Open the queue. Items a previous run left in flight go back to pending.
  pub fn new(db: Arc<Database>) -> Result<Self> {
    let queue = Self { db };
    let recovered = queue.recover_in_flight()?;
    if recovered > 0 {
      info!(recovered, "requeued mutations left in flight");
    }
    Ok(queue)
  }

  pub fn enqueue(&self, mutation: NewMutation) -> Result<QueuedMutation> {
    self.insert(mutation, MutationStatus::Pending)
  }

  /// Queue a mutation whose first send is still running.
  ///
  /// The item is not eligible for replay until that send settles through
  /// [`complete`](Self::complete) or [`fail`](Self::fail).
  pub fn enqueue_in_flight(&self, mutation: NewMutation) -> Result<QueuedMutation> {
    self.insert(mutation, MutationStatus::InFlight)
  }

  fn insert(&self, mutation: NewMutation, status: MutationStatus) -> Result<QueuedMutation> {
    let headers = serde_json::to_string(&mutation.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let enqueued_at = Utc::now();

    let id = {
      let conn = self.db.conn();
      conn
        .execute(
          "INSERT INTO mutation_queue (url, method, headers, body, enqueued_at, retry_count, status)
           VALUES (?, ?, ?, ?, ?, 0, ?)",
          params![
            mutation.url.as_str(),
            mutation.method.as_str(),
            headers,
            mutation.body.as_deref(),
            enqueued_at.to_rfc3339(),
            status.as_str(),
          ],
        )
        .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;
      conn.last_insert_rowid()
    };

    info!(
      id,
      method = %mutation.method,
      url = %mutation.url,
      status = status.as_str(),
      "queued mutation"
    );

    Ok(QueuedMutation {
      id,
      url: mutation.url.into(),
      method: mutation.method,
      headers: mutation.headers,
      body: mutation.body,
      enqueued_at,
      retry_count: 0,
      status,
      last_error: None,
    })
  }

  pub fn get(&self, id: i64) -> Result<Option<QueuedMutation>> {
    let raw = self
      .db
      .conn()
      .query_row(
        &format!("{} WHERE id = ?", SELECT_COLUMNS),
        params![id],
        QueuedMutation::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read mutation {}: {}", id, e))?;

    raw.map(RawMutation::parse).transpose()
  }

  /// Every queued mutation, oldest first.
  pub fn list(&self) -> Result<Vec<QueuedMutation>> {
    self.select(&format!("{} ORDER BY id", SELECT_COLUMNS))
  }

  /// Mutations eligible for replay (pending or failed), oldest first.
  pub fn pending(&self) -> Result<Vec<QueuedMutation>> {
    self.select(&format!(
      "{} WHERE status IN ('pending', 'failed') ORDER BY id",
      SELECT_COLUMNS
    ))
  }

  fn select(&self, sql: &str) -> Result<Vec<QueuedMutation>> {
    let raws = {
      let conn = self.db.conn();
      let mut stmt = conn
        .prepare(sql)
        .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;
      let rows = stmt
        .query_map([], QueuedMutation::from_row)
        .map_err(|e| eyre!("Failed to query queue: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read queue row: {}", e))?;
      rows
    };

    raws.into_iter().map(RawMutation::parse).collect()
  }

  pub fn mark_in_flight(&self, id: i64) -> Result<()> {
    self.set_status(id, MutationStatus::InFlight)
  }

  /// Replay confirmed: the mutation is done and leaves the queue.
  pub fn complete(&self, id: i64) -> Result<()> {
    self
      .db
      .conn()
      .execute("DELETE FROM mutation_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete mutation {}: {}", id, e))?;
    debug!(id, status = MutationStatus::Done.as_str(), "mutation replayed");
    Ok(())
  }

  /// Replay failed: keep the mutation, bump its retry count. Returns the new count.
  pub fn fail(&self, id: i64, reason: &str) -> Result<u32> {
    let conn = self.db.conn();
    conn
      .execute(
        "UPDATE mutation_queue SET status = ?, retry_count = retry_count + 1, last_error = ?
         WHERE id = ?",
        params![MutationStatus::Failed.as_str(), reason, id],
      )
      .map_err(|e| eyre!("Failed to update mutation {}: {}", id, e))?;

    conn
      .query_row(
        "SELECT retry_count FROM mutation_queue WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read mutation {}: {}", id, e))
  }

  /// Operator purge. Returns how many mutations were dropped.
  pub fn purge(&self) -> Result<usize> {
    let purged = self
      .db
      .conn()
      .execute("DELETE FROM mutation_queue", [])
      .map_err(|e| eyre!("Failed to purge queue: {}", e))?;
    info!(purged, "purged mutation queue");
    Ok(purged)
  }

  pub fn count_by_status(&self) -> Result<QueueCounts> {
    let conn = self.db.conn();
    let mut stmt = conn
      .prepare("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")
      .map_err(|e| eyre!("Failed to prepare count query: {}", e))?;
    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;

    let mut counts = QueueCounts::default();
    for (status, count) in rows {
      let count = count as u64;
      match status.parse::<MutationStatus>()? {
        MutationStatus::Pending => counts.pending = count,
        MutationStatus::InFlight => counts.in_flight = count,
        MutationStatus::Failed => counts.failed = count,
        MutationStatus::Done => {}
      }
    }
    Ok(counts)
  }

  pub fn recover_in_flight(&self) -> Result<usize> {
    self
      .db
      .conn()
      .execute(
        "UPDATE mutation_queue SET status = 'pending' WHERE status = 'in_flight'",
        [],
      )
      .map_err(|e| eyre!("Failed to recover in-flight mutations: {}", e))
  }

  fn set_status(&self, id: i64, status: MutationStatus) -> Result<()> {
    self
      .db
      .conn()
      .execute(
        "UPDATE mutation_queue SET status = ? WHERE id = ?",
        params![status.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to update mutation {}: {}", id, e))?;
    Ok(())
  }
}
