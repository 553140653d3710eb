//! Cache manager that owns the cache generations and talks to the network for seeding.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::{CacheStorage, StoreError};
use super::types::{CacheStatus, NamespaceStatus, SeedFailure, SeedReport, StoredResponse};
use crate::config::CacheConfig;
use crate::error::EngineError;
use crate::http::{Request, RequestKey, Response};
use crate::network::Network;

/// Manages named cache generations.
///
/// Two generations are current at any time: one for precached static assets
/// and one for responses cached at runtime. Anything else in storage belongs
/// to an older version and is removed by [`CacheManager::purge_stale`].
pub struct CacheManager {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  static_namespace: String,
  dynamic_namespace: String,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl CacheManager {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    config: &CacheConfig,
  ) -> Self {
    Self {
      storage,
      network,
      static_namespace: config.static_namespace.clone(),
      dynamic_namespace: config.dynamic_namespace.clone(),
      stale_time: Duration::seconds(config.revalidate_after_secs as i64),
    }
  }

  pub fn static_namespace(&self) -> &str {
    &self.static_namespace
  }

  pub fn dynamic_namespace(&self) -> &str {
    &self.dynamic_namespace
  }

  pub fn current_namespaces(&self) -> BTreeSet<String> {
    [self.static_namespace.clone(), self.dynamic_namespace.clone()]
      .into_iter()
      .collect()
  }

  /// Check if cached data is stale based on its storage timestamp.
  pub fn is_stale(&self, stored_at: DateTime<Utc>) -> bool {
    Utc::now() - stored_at >= self.stale_time
  }

  /// Create the namespace if absent.
  pub fn open(&self, namespace: &str) -> Result<(), StoreError> {
    if self.storage.create_namespace(namespace)? {
      debug!(namespace, "created cache namespace");
    }
    Ok(())
  }

  /// Fetch and store every URL, best effort.
  ///
  /// URLs are fetched concurrently. A failed URL is recorded in the report and
  /// does not affect the others; everything that succeeded stays stored.
  pub async fn seed(&self, namespace: &str, urls: &[Url]) -> SeedReport {
    if let Err(e) = self.open(namespace) {
      warn!(namespace, error = %e, "could not open namespace for seeding");
    }

    let fetches = urls.iter().map(|url| {
      let request = Request::get(url.clone());
      let key = request.key();
      let fetch = self.network.fetch(request);
      async move {
        let outcome = match fetch.await {
          Ok(response) if response.ok() => {
            if self.store(namespace, &key, &response) {
              Ok(())
            } else {
              Err("response could not be stored".to_string())
            }
          }
          Ok(response) => Err(format!("HTTP {}", response.status)),
          Err(e) => Err(e.to_string()),
        };
        (url.to_string(), outcome)
      }
    });

    let mut report = SeedReport {
      namespace: namespace.to_string(),
      stored: Vec::new(),
      failures: Vec::new(),
    };
    for (url, outcome) in join_all(fetches).await {
      match outcome {
        Ok(()) => report.stored.push(url),
        Err(reason) => {
          warn!(%url, %reason, "seed failed");
          report.failures.push(SeedFailure { url, reason });
        }
      }
    }

    match report.partial_failure() {
      Some(err) => warn!(error = %err, "seeding incomplete"),
      None => info!(namespace, count = report.stored.len(), "seeding complete"),
    }
    report
  }

  /// Delete every namespace not in `current`. Returns the deleted names.
  pub fn purge_stale(&self, current: &BTreeSet<String>) -> Result<Vec<String>, StoreError> {
    let mut purged = Vec::new();
    for name in self.storage.namespaces()? {
      if current.contains(&name) {
        continue;
      }
      if self.storage.delete_namespace(&name)? {
        info!(namespace = %name, "deleted stale cache generation");
        purged.push(name);
      }
    }
    Ok(purged)
  }

  /// Look a key up in the current generations, static first.
  pub fn lookup(&self, key: &RequestKey) -> Option<StoredResponse> {
    self
      .lookup_in(&self.static_namespace, key)
      .or_else(|| self.lookup_in(&self.dynamic_namespace, key))
  }

  pub fn lookup_in(&self, namespace: &str, key: &RequestKey) -> Option<StoredResponse> {
    match self.storage.get(namespace, key) {
      Ok(Some(hit)) => {
        debug!(namespace, %key, "cache hit");
        Some(hit)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(namespace, %key, error = %e, "cache lookup failed");
        None
      }
    }
  }

  /// Store a response if it is a success. Returns whether it was stored.
  ///
  /// Failures are swallowed: a full cache or a storage error only costs a
  /// future cache hit.
  pub fn store(&self, namespace: &str, key: &RequestKey, response: &Response) -> bool {
    if !response.ok() {
      debug!(%key, status = response.status, "not caching unsuccessful response");
      return false;
    }

    let stored = StoredResponse::from_response(response, Utc::now());
    match self.storage.put(namespace, key, &stored) {
      Ok(()) => true,
      Err(e) => match EngineError::from(e) {
        EngineError::QuotaExceeded => {
          debug!(namespace, %key, "cache quota exceeded, skipping store");
          false
        }
        other => {
          warn!(namespace, %key, error = %other, "cache store failed");
          false
        }
      },
    }
  }

  pub fn status(&self) -> Result<CacheStatus, StoreError> {
    let current = self.current_namespaces();
    let mut namespaces = Vec::new();
    for name in self.storage.namespaces()? {
      let usage = self.storage.usage(&name)?;
      namespaces.push(NamespaceStatus {
        current: current.contains(&name),
        name,
        entries: usage.entries,
        bytes: usage.bytes,
      });
    }

    Ok(CacheStatus {
      generations: vec![
        self.static_namespace.clone(),
        self.dynamic_namespace.clone(),
      ],
      namespaces,
    })
  }

  /// Delete every namespace, current ones included.
  pub fn clear(&self) -> Result<Vec<String>, StoreError> {
    let mut cleared = Vec::new();
    for name in self.storage.namespaces()? {
      if self.storage.delete_namespace(&name)? {
        cleared.push(name);
      }
    }
    info!(count = cleared.len(), "cleared caches");
    Ok(cleared)
  }

  pub fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, StoreError> {
    self.storage.keys(namespace)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{NamespaceUsage, SqliteStorage};
  use crate::db::Database;
  use crate::testing::FakeNetwork;

  fn manager(network: &FakeNetwork) -> CacheManager {
    let storage = SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()));
    CacheManager::new(
      Arc::new(storage),
      Arc::new(network.clone()),
      &CacheConfig::default(),
    )
  }

  fn urls(paths: &[&str]) -> Vec<Url> {
    paths.iter().map(|p| FakeNetwork::url(p)).collect()
  }

  #[tokio::test]
  async fn test_seed_is_best_effort() {
    let network = FakeNetwork::new();
    network.route("/a", 200, "a");
    network.route("/b", 200, "b");
    // "/missing" has no route and answers 404

    let manager = manager(&network);
    let report = manager
      .seed("static-v1", &urls(&["/a", "/missing", "/b"]))
      .await;

    assert_eq!(report.stored.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].url, "https://dream.example/missing");
    assert_eq!(report.failures[0].reason, "HTTP 404");
    assert!(report.partial_failure().is_some());

    let keys: Vec<String> = manager
      .keys("static-v1")
      .unwrap()
      .into_iter()
      .map(|k| k.url)
      .collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&"https://dream.example/a".to_string()));
    assert!(keys.contains(&"https://dream.example/b".to_string()));
  }

  #[tokio::test]
  async fn test_seed_while_offline_stores_nothing_but_succeeds() {
    let network = FakeNetwork::new();
    network.route("/a", 200, "a");
    network.set_offline(true);

    let manager = manager(&network);
    let report = manager.seed("static-v1", &urls(&["/a"])).await;
    assert!(report.stored.is_empty());
    assert_eq!(report.failures.len(), 1);
    // The namespace exists even though nothing could be stored
    assert!(manager
      .status()
      .unwrap()
      .namespaces
      .iter()
      .any(|n| n.name == "static-v1"));
  }

  #[tokio::test]
  async fn test_purge_keeps_only_current() {
    let network = FakeNetwork::new();
    let manager = manager(&network);
    let response = Response::text(200, "text/plain", "x");
    let key = RequestKey::get(&FakeNetwork::url("/a"));

    manager.store("dreamos-static-v3", &key, &response);
    manager.store("dreamos-static-v4", &key, &response);
    manager.store("dreamos-dynamic-v4", &key, &response);

    let purged = manager.purge_stale(&manager.current_namespaces()).unwrap();
    assert_eq!(purged, vec!["dreamos-static-v3".to_string()]);

    let names: Vec<String> = manager
      .status()
      .unwrap()
      .namespaces
      .into_iter()
      .map(|n| n.name)
      .collect();
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&"dreamos-static-v3".to_string()));

    // Second purge has nothing left to do
    assert!(manager
      .purge_stale(&manager.current_namespaces())
      .unwrap()
      .is_empty());
  }

  #[test]
  fn test_store_skips_unsuccessful_responses() {
    let network = FakeNetwork::new();
    let manager = manager(&network);
    let key = RequestKey::get(&FakeNetwork::url("/a"));

    assert!(!manager.store("ns", &key, &Response::new(500)));
    assert!(!manager.store("ns", &key, &Response::error()));
    assert!(manager.lookup_in("ns", &key).is_none());

    assert!(manager.store("ns", &key, &Response::new(200)));
    assert!(manager.lookup_in("ns", &key).is_some());
  }

  #[test]
  fn test_lookup_prefers_static_generation() {
    let network = FakeNetwork::new();
    let manager = manager(&network);
    let key = RequestKey::get(&FakeNetwork::url("/page"));

    manager.store(
      manager.dynamic_namespace(),
      &key,
      &Response::text(200, "text/html", "dynamic"),
    );
    assert_eq!(manager.lookup(&key).unwrap().body.as_ref(), b"dynamic");

    manager.store(
      manager.static_namespace(),
      &key,
      &Response::text(200, "text/html", "static"),
    );
    assert_eq!(manager.lookup(&key).unwrap().body.as_ref(), b"static");
  }

  /// Storage that is always full.
  struct FullStorage;

  impl CacheStorage for FullStorage {
    fn create_namespace(&self, _name: &str) -> Result<bool, StoreError> {
      Ok(true)
    }
    fn namespaces(&self) -> Result<Vec<String>, StoreError> {
      Ok(Vec::new())
    }
    fn delete_namespace(&self, _name: &str) -> Result<bool, StoreError> {
      Ok(false)
    }
    fn get(&self, _ns: &str, _key: &RequestKey) -> Result<Option<StoredResponse>, StoreError> {
      Ok(None)
    }
    fn put(&self, _ns: &str, _key: &RequestKey, _r: &StoredResponse) -> Result<(), StoreError> {
      Err(StoreError::QuotaExceeded)
    }
    fn keys(&self, _ns: &str) -> Result<Vec<RequestKey>, StoreError> {
      Ok(Vec::new())
    }
    fn usage(&self, _ns: &str) -> Result<NamespaceUsage, StoreError> {
      Ok(NamespaceUsage::default())
    }
  }

  #[test]
  fn test_quota_exceeded_is_swallowed() {
    let network = FakeNetwork::new();
    let manager = CacheManager::new(
      Arc::new(FullStorage),
      Arc::new(network),
      &CacheConfig::default(),
    );
    let key = RequestKey::get(&FakeNetwork::url("/big"));
    assert!(!manager.store("ns", &key, &Response::new(200)));
  }

  #[test]
  fn test_staleness() {
    let network = FakeNetwork::new();
    let config = CacheConfig {
      revalidate_after_secs: 60,
      ..CacheConfig::default()
    };
    let storage = SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()));
    let manager = CacheManager::new(Arc::new(storage), Arc::new(network), &config);

    assert!(!manager.is_stale(Utc::now()));
    assert!(manager.is_stale(Utc::now() - Duration::seconds(61)));
  }
}
