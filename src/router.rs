//! Request classification.

use color_eyre::{eyre::eyre, Result};
use regex::RegexSet;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::config::RoutingConfig;
use crate::http::{Method, Request};

/// Retrieval policy for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Not intercepted; the host performs the request itself
  Bypass,
  CacheFirst,
  NetworkFirst,
  NetworkOnly,
  CacheOnly,
  /// Bridge/API surface: cached value now, refreshed in the background
  StaleWhileRevalidate,
}

/// Maps requests to strategies.
///
/// Rules are checked in a fixed order and the first match wins, so a path
/// that is both admin and API resolves by priority, not by combination.
pub struct Router {
  always_fresh: RegexSet,
  bridge: RegexSet,
  static_extensions: BTreeSet<String>,
}

impl Router {
  pub fn new(config: &RoutingConfig) -> Result<Self> {
    let always_fresh = RegexSet::new(&config.always_fresh)
      .map_err(|e| eyre!("Invalid always_fresh pattern: {}", e))?;
    let bridge =
      RegexSet::new(&config.bridge).map_err(|e| eyre!("Invalid bridge pattern: {}", e))?;

    Ok(Self {
      always_fresh,
      bridge,
      static_extensions: config.static_extensions.clone(),
    })
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    // 1. Only plain GETs over http(s) are intercepted
    if request.method != Method::Get || !matches!(request.url.scheme(), "http" | "https") {
      return Strategy::Bypass;
    }

    // 2. Page loads
    if request.is_navigation() {
      return Strategy::NetworkFirst;
    }

    // 3. Surfaces that must never be stale
    if self.is_always_fresh(request) {
      return Strategy::NetworkOnly;
    }

    // 4. Sync/bridge/API
    if self.is_bridge(request) {
      return Strategy::StaleWhileRevalidate;
    }

    // 5. Static assets
    if self.is_static_asset(request) {
      return Strategy::CacheFirst;
    }

    // 6. Everything else
    Strategy::NetworkFirst
  }

  pub fn is_always_fresh(&self, request: &Request) -> bool {
    self.always_fresh.is_match(request.url.path())
  }

  pub fn is_bridge(&self, request: &Request) -> bool {
    self.bridge.is_match(request.url.path())
  }

  pub fn is_static_asset(&self, request: &Request) -> bool {
    request
      .extension()
      .is_some_and(|ext| self.static_extensions.contains(&ext))
  }

  /// Mutating bridge calls that should be deferred rather than lost when offline.
  pub fn is_queueable(&self, request: &Request) -> bool {
    request.method.is_mutating()
      && matches!(request.url.scheme(), "http" | "https")
      && self.is_bridge(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn router() -> Router {
    Router::new(&RoutingConfig::default()).unwrap()
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse("https://dream.example").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_non_get_is_bypassed() {
    let req = Request {
      method: Method::Post,
      ..get("/api/items")
    };
    assert_eq!(router().classify(&req), Strategy::Bypass);
  }

  #[test]
  fn test_foreign_scheme_is_bypassed() {
    let req = Request::get(Url::parse("chrome-extension://abc/script.js").unwrap());
    assert_eq!(router().classify(&req), Strategy::Bypass);
  }

  #[test]
  fn test_navigation_wins_over_everything() {
    let req = get("/admin/dashboard").with_header("accept", "text/html");
    assert_eq!(router().classify(&req), Strategy::NetworkFirst);
  }

  #[test]
  fn test_admin_before_api() {
    let router = Router::new(&RoutingConfig {
      always_fresh: vec!["^/api/admin".to_string()],
      ..RoutingConfig::default()
    })
    .unwrap();
    assert_eq!(
      router.classify(&get("/api/admin/users")),
      Strategy::NetworkOnly
    );
    assert_eq!(
      router.classify(&get("/api/users")),
      Strategy::StaleWhileRevalidate
    );
  }

  #[test]
  fn test_bridge_before_static_extension() {
    assert_eq!(
      router().classify(&get("/api/config.json")),
      Strategy::StaleWhileRevalidate
    );
    assert_eq!(
      router().classify(&get("/sync/status")),
      Strategy::StaleWhileRevalidate
    );
  }

  #[test]
  fn test_static_assets_are_cache_first() {
    for path in ["/css/main.css", "/js/main.js", "/icons/icon.PNG", "/fonts/a.woff2"] {
      assert_eq!(router().classify(&get(path)), Strategy::CacheFirst, "{}", path);
    }
  }

  #[test]
  fn test_default_is_network_first() {
    assert_eq!(router().classify(&get("/feed")), Strategy::NetworkFirst);
    assert_eq!(router().classify(&get("/archive.tar")), Strategy::NetworkFirst);
  }

  #[test]
  fn test_queueable() {
    let post = |path: &str| Request {
      method: Method::Post,
      ..get(path)
    };
    assert!(router().is_queueable(&post("/api/notes")));
    assert!(!router().is_queueable(&post("/contact")));
    assert!(!router().is_queueable(&get("/api/notes")));
  }

  #[test]
  fn test_invalid_pattern_is_rejected() {
    let config = RoutingConfig {
      bridge: vec!["(".to_string()],
      ..RoutingConfig::default()
    };
    assert!(Router::new(&config).is_err());
  }
}
