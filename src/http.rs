//! Request and response types crossing the interception boundary.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Header map with lowercased names.
pub type Headers = BTreeMap<String, String>;

/// HTTP request method
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Options => "OPTIONS",
    }
  }

  /// Methods whose effects must not be lost when the network is down.
  pub fn is_mutating(&self) -> bool {
    matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "HEAD" => Ok(Self::Head),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      "OPTIONS" => Ok(Self::Options),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// Request mode as reported by the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  #[default]
  Cors,
  NoCors,
  SameOrigin,
  /// Full page load
  Navigate,
}

/// Request cache mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
  #[default]
  Default,
  NoStore,
  Reload,
  /// Answer from the cache or not at all
  OnlyIfCached,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub mode: RequestMode,
  pub cache_mode: CacheMode,
  pub body: Option<Bytes>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      mode: RequestMode::default(),
      cache_mode: CacheMode::default(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// A full page load of `url`.
  pub fn navigate(url: Url) -> Self {
    Self::get(url)
      .with_mode(RequestMode::Navigate)
      .with_header("accept", "text/html,application/xhtml+xml")
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
    self.cache_mode = cache_mode;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// True for full page loads, either by mode or by an HTML `Accept` header.
  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
      || self
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html"))
  }

  /// Lowercased extension of the last path segment, if any.
  pub fn extension(&self) -> Option<String> {
    let segment = self.url.path_segments()?.next_back()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
      return None;
    }
    Some(ext.to_ascii_lowercase())
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(self.method, &self.url)
  }
}

/// Normalized `(method, url)` pair used to address cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestKey {
  pub method: Method,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method,
      url: url.into(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// Stable, fixed-length storage key.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A response produced by the network, the cache, or a generated fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  /// Status code; 0 marks an opaque or error response
  pub status: u16,
  pub headers: Headers,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: Bytes::new(),
    }
  }

  /// Network error response.
  pub fn error() -> Self {
    Self::new(0)
  }

  pub fn text(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
    Self::new(status)
      .with_header("content-type", content_type)
      .with_body(body)
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::text(status, "application/json", value.to_string())
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Check if response is a success
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_opaque(&self) -> bool {
    self.status == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_method_parse_is_case_insensitive() {
    assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
    assert_eq!("DELETE".parse::<Method>().unwrap(), Method::Delete);
    assert!("BREW".parse::<Method>().is_err());
  }

  #[test]
  fn test_mutating_methods() {
    assert!(Method::Post.is_mutating());
    assert!(Method::Patch.is_mutating());
    assert!(!Method::Get.is_mutating());
    assert!(!Method::Head.is_mutating());
  }

  #[test]
  fn test_key_drops_fragment() {
    let a = RequestKey::get(&url("https://example.com/page#top"));
    let b = RequestKey::get(&url("https://EXAMPLE.com/page"));
    assert_eq!(a, b);
    assert_eq!(a.digest(), b.digest());
    assert_eq!(a.digest().len(), 64);
  }

  #[test]
  fn test_key_distinguishes_method() {
    let u = url("https://example.com/api/items");
    assert_ne!(
      RequestKey::new(Method::Get, &u).digest(),
      RequestKey::new(Method::Post, &u).digest()
    );
  }

  #[test]
  fn test_navigation_detection() {
    let u = url("https://example.com/");
    assert!(Request::navigate(u.clone()).is_navigation());
    assert!(Request::get(u.clone())
      .with_header("Accept", "text/html")
      .is_navigation());
    assert!(!Request::get(u).is_navigation());
  }

  #[test]
  fn test_extension() {
    let req = Request::get(url("https://example.com/css/Main.CSS?v=2"));
    assert_eq!(req.extension().as_deref(), Some("css"));
    assert_eq!(Request::get(url("https://example.com/")).extension(), None);
    assert_eq!(
      Request::get(url("https://example.com/.hidden")).extension(),
      None
    );
  }

  #[test]
  fn test_response_ok_range() {
    assert!(Response::new(200).ok());
    assert!(Response::new(299).ok());
    assert!(!Response::new(304).ok());
    assert!(!Response::new(404).ok());
    assert!(!Response::error().ok());
    assert!(Response::error().is_opaque());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let resp = Response::text(200, "text/css", "");
    assert_eq!(resp.header("Content-Type"), Some("text/css"));
  }
}
