//! Core types for the response cache.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::EngineError;
use crate::http::{Headers, Response};

/// A response as persisted in a cache generation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: Headers,
  pub body: Bytes,
  /// When the response was stored
  pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
  /// Snapshot a response for storage. The body is reference-counted, so the
  /// caller keeps a usable copy.
  pub fn from_response(response: &Response, stored_at: DateTime<Utc>) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at,
    }
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Result of a strategy run, including the response and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cached data served first, with a background refresh when stale.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Cached data served because the network failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Generated stand-in (offline page, stub asset, error body).
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }

  /// Mutation accepted into the offline queue.
  pub fn queued(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Queued,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale; a refresh is running
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Nothing cached and network unavailable, serving a generated response
  Fallback,
  /// Mutation deferred to the offline queue
  Queued,
}

/// Per-namespace usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceStatus {
  pub name: String,
  pub entries: u64,
  pub bytes: u64,
  /// Whether this namespace is one of the engine's current generations
  pub current: bool,
}

/// Answer to a cache status query.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
  /// Names of the current generations
  pub generations: Vec<String>,
  pub namespaces: Vec<NamespaceStatus>,
}

/// One seed URL that could not be stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedFailure {
  pub url: String,
  pub reason: String,
}

/// Outcome of best-effort seeding.
#[derive(Debug, Clone, Serialize)]
pub struct SeedReport {
  pub namespace: String,
  pub stored: Vec<String>,
  pub failures: Vec<SeedFailure>,
}

impl SeedReport {
  pub fn is_complete(&self) -> bool {
    self.failures.is_empty()
  }

  pub fn partial_failure(&self) -> Option<EngineError> {
    if self.is_complete() {
      return None;
    }
    Some(EngineError::SeedPartialFailure {
      namespace: self.namespace.clone(),
      failed: self.failures.len(),
      total: self.failures.len() + self.stored.len(),
    })
  }
}
