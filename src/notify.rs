//! Channel from the engine to its connected clients.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::CacheStatus;
use crate::queue::ReplayResult;

/// Identifies one connected client (a page or tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "client-{}", self.0)
  }
}

/// Messages sent to clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
  ActivationComplete {
    purged: Vec<String>,
  },
  SyncComplete {
    results: Vec<ReplayResult>,
  },
  CacheCleared {
    namespaces: Vec<String>,
  },
  CacheStatus(CacheStatus),
  SyncStatus {
    pending: u64,
    failed: u64,
    last_sync: Option<DateTime<Utc>>,
  },
  MutationQueued {
    id: i64,
    url: String,
  },
}

/// Fan-out of [`ServerMessage`]s to every connected client.
#[derive(Default)]
pub struct Notifier {
  next_id: AtomicU64,
  clients: Mutex<BTreeMap<ClientId, mpsc::UnboundedSender<ServerMessage>>>,
}

impl Notifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn connect(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
    let id = ClientId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    let (tx, rx) = mpsc::unbounded_channel();
    self.clients().insert(id, tx);
    debug!(client = %id, "client connected");
    (id, rx)
  }

  pub fn disconnect(&self, id: ClientId) {
    if self.clients().remove(&id).is_some() {
      debug!(client = %id, "client disconnected");
    }
  }

  /// Send to every client. Returns how many received it.
  pub fn broadcast(&self, message: ServerMessage) -> usize {
    let mut clients = self.clients();
    // Receivers that were dropped are pruned here
    clients.retain(|_, tx| tx.send(message.clone()).is_ok());
    clients.len()
  }

  /// Send to one client only. Returns whether it was delivered.
  pub fn reply(&self, id: ClientId, message: ServerMessage) -> bool {
    let mut clients = self.clients();
    let delivered = clients
      .get(&id)
      .is_some_and(|tx| tx.send(message).is_ok());
    if !delivered {
      clients.remove(&id);
      debug!(client = %id, "reply dropped, client gone");
    }
    delivered
  }

  pub fn client_count(&self) -> usize {
    self.clients().len()
  }

  fn clients(&self) -> MutexGuard<'_, BTreeMap<ClientId, mpsc::UnboundedSender<ServerMessage>>> {
    self
      .clients
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
