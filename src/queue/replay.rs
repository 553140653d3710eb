//! Replay of deferred mutations once the origin is reachable again.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::{MutationQueue, QueuedMutation};
use crate::db::Database;
use crate::error::EngineError;
use crate::http::Method;
use crate::network::Network;
use crate::notify::ClientId;

/// What asked for a replay. Passed explicitly into every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayTrigger {
  /// Background sync fired after connectivity returned
  Connectivity { tag: String },
  /// Periodic sync fired by the host scheduler
  Periodic { tag: String },
  /// A client sent TRIGGER_SYNC
  Client { client: ClientId },
  /// Operator asked from the command line
  Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplayOutcome {
  Succeeded { status: u16 },
  Failed { reason: String, retry_count: u32 },
  /// Not sent: an older mutation to the same endpoint failed in this run
  Skipped { blocked_by: i64 },
}

/// Outcome of replaying one mutation.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
  pub id: i64,
  pub method: Method,
  pub url: String,
  #[serde(flatten)]
  pub outcome: ReplayOutcome,
}

impl ReplayResult {
  pub fn succeeded(&self) -> bool {
    matches!(self.outcome, ReplayOutcome::Succeeded { .. })
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
  pub trigger: ReplayTrigger,
  /// Per-item results ordered by mutation id
  pub results: Vec<ReplayResult>,
}

impl ReplayReport {
  pub fn succeeded(&self) -> usize {
    self.results.iter().filter(|r| r.succeeded()).count()
  }

  pub fn failed(&self) -> usize {
    self
      .results
      .iter()
      .filter(|r| matches!(r.outcome, ReplayOutcome::Failed { .. }))
      .count()
  }

  pub fn skipped(&self) -> usize {
    self
      .results
      .iter()
      .filter(|r| matches!(r.outcome, ReplayOutcome::Skipped { .. }))
      .count()
  }
}

/// Drains the mutation queue against the network.
pub struct Replayer {
  queue: Arc<MutationQueue>,
  network: Arc<dyn Network>,
  db: Arc<Database>,
  timeout: Duration,
  /// One replay at a time, so no mutation is sent twice concurrently
  running: Mutex<()>,
}

impl Replayer {
  pub fn new(
    queue: Arc<MutationQueue>,
    network: Arc<dyn Network>,
    db: Arc<Database>,
    timeout: Duration,
  ) -> Self {
    Self {
      queue,
      network,
      db,
      timeout,
      running: Mutex::new(()),
    }
  }

  /// Replay every pending mutation.
  ///
  /// Endpoints are replayed concurrently; mutations to the same endpoint are
  /// sent one after another, oldest first. A failure ends its endpoint's run:
  /// the newer mutations behind it stay queued untouched, so an older write
  /// never lands after a newer one. Other endpoints carry on.
  pub async fn replay(&self, trigger: ReplayTrigger) -> color_eyre::Result<ReplayReport> {
    let _running = self.running.lock().await;

    let pending = self.queue.pending()?;
    if pending.is_empty() {
      debug!(?trigger, "replay: queue empty");
      return Ok(ReplayReport {
        trigger,
        results: Vec::new(),
      });
    }

    // `pending` is ordered by id, so each group stays oldest-first
    let mut endpoints: BTreeMap<String, Vec<QueuedMutation>> = BTreeMap::new();
    for item in pending {
      endpoints.entry(item.endpoint()).or_default().push(item);
    }

    info!(
      ?trigger,
      endpoints = endpoints.len(),
      "replaying queued mutations"
    );

    let runs = endpoints
      .into_values()
      .map(|items| self.replay_endpoint(items));
    let mut results: Vec<ReplayResult> = join_all(runs).await.into_iter().flatten().collect();
    results.sort_by_key(|r| r.id);

    let report = ReplayReport { trigger, results };
    if report.succeeded() > 0 {
      if let Err(e) = self.db.record_sync(Utc::now()) {
        warn!(error = %e, "could not record sync time");
      }
    }
    info!(
      succeeded = report.succeeded(),
      failed = report.failed(),
      skipped = report.skipped(),
      "replay finished"
    );

    Ok(report)
  }

  async fn replay_endpoint(&self, items: Vec<QueuedMutation>) -> Vec<ReplayResult> {
    let mut results = Vec::with_capacity(items.len());
    let mut blocked_by = None;
    for item in items {
      if let Some(blocked_by) = blocked_by {
        debug!(id = item.id, blocked_by, "replay held back behind failed mutation");
        results.push(ReplayResult {
          id: item.id,
          method: item.method,
          url: item.url,
          outcome: ReplayOutcome::Skipped { blocked_by },
        });
        continue;
      }

      let id = item.id;
      let result = self.replay_one(item).await;
      if !result.succeeded() {
        blocked_by = Some(id);
      }
      results.push(result);
    }
    results
  }

  async fn replay_one(&self, item: QueuedMutation) -> ReplayResult {
    let outcome = match self.send(&item).await {
      Ok(status) => match self.queue.complete(item.id) {
        Ok(()) => ReplayOutcome::Succeeded { status },
        // Sent but still queued; it will be sent again next time
        Err(e) => self.record_failure(&item, format!("sent but not dequeued: {}", e)),
      },
      Err(reason) => self.record_failure(&item, reason),
    };

    ReplayResult {
      id: item.id,
      method: item.method,
      url: item.url,
      outcome,
    }
  }

  async fn send(&self, item: &QueuedMutation) -> Result<u16, String> {
    self
      .queue
      .mark_in_flight(item.id)
      .map_err(|e| e.to_string())?;
    let request = item.to_request().map_err(|e| e.to_string())?;

    match tokio::time::timeout(self.timeout, self.network.fetch(request)).await {
      Ok(Ok(response)) if response.ok() => Ok(response.status),
      Ok(Ok(response)) => Err(format!("HTTP {}", response.status)),
      Ok(Err(e)) => Err(e.to_string()),
      Err(_) => Err("timed out".to_string()),
    }
  }

  fn record_failure(&self, item: &QueuedMutation, reason: String) -> ReplayOutcome {
    let err = EngineError::ReplayFailure {
      id: item.id,
      reason: reason.clone(),
    };
    warn!(error = %err, url = %item.url, "replay failed");

    let retry_count = match self.queue.fail(item.id, &reason) {
      Ok(count) => count,
      Err(e) => {
        warn!(id = item.id, error = %e, "could not record replay failure");
        item.retry_count + 1
      }
    };
    ReplayOutcome::Failed {
      reason,
      retry_count,
    }
  }
}
