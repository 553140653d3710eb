//! Generated responses for when neither the network nor the cache can answer.

use serde_json::json;

use crate::http::{Request, Response};

/// 1x1 transparent GIF
const TRANSPARENT_GIF: &[u8] = &[
  0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
  0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
  0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

const OFFLINE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Offline - Dream OS</title>
</head>
<body>
<main>
<h1>You are offline</h1>
<p>Dream OS cannot reach the network. Cached pages remain available and changes will sync when you reconnect.</p>
<button onclick="location.reload()">Retry</button>
</main>
</body>
</html>
"#;

/// Kind of resource a request is for, as far as fallbacks care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
  Navigation,
  Stylesheet,
  Script,
  Image,
  Api,
  Other,
}

impl AssetClass {
  pub fn of(request: &Request, is_bridge: bool) -> Self {
    if request.is_navigation() {
      return Self::Navigation;
    }
    if is_bridge {
      return Self::Api;
    }
    match request.extension().as_deref() {
      Some("css") => Self::Stylesheet,
      Some("js") => Self::Script,
      Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico") => Self::Image,
      _ => Self::Other,
    }
  }
}

/// Deterministic stand-in for an asset class.
///
/// Navigation is answered with the generated offline page; callers that have
/// a cached offline page serve that first.
pub fn stub(class: AssetClass) -> Response {
  match class {
    AssetClass::Navigation => offline_page(),
    AssetClass::Stylesheet => Response::text(200, "text/css", ""),
    AssetClass::Script => Response::text(200, "application/javascript", ""),
    AssetClass::Image => Response::text(200, "image/gif", TRANSPARENT_GIF),
    AssetClass::Api => api_unavailable(),
    AssetClass::Other => Response::new(503),
  }
}

pub fn offline_page() -> Response {
  Response::text(503, "text/html; charset=utf-8", OFFLINE_HTML)
}

pub fn api_unavailable() -> Response {
  Response::json(
    503,
    &json!({
      "error": "Network error and no cache available",
      "offline": true,
    }),
  )
}

/// Answer for a cache-only request with nothing cached.
pub fn not_cached() -> Response {
  Response::text(404, "text/plain", "Not found in cache")
}

/// Answer for a mutation accepted into the offline queue.
pub fn queued(id: i64) -> Response {
  Response::json(202, &json!({ "queued": true, "id": id }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn get(path: &str) -> Request {
    Request::get(Url::parse("https://dream.example").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_asset_classes() {
    assert_eq!(AssetClass::of(&get("/css/a.css"), false), AssetClass::Stylesheet);
    assert_eq!(AssetClass::of(&get("/js/a.js"), false), AssetClass::Script);
    assert_eq!(AssetClass::of(&get("/img/a.WEBP"), false), AssetClass::Image);
    assert_eq!(AssetClass::of(&get("/api/a.json"), true), AssetClass::Api);
    assert_eq!(AssetClass::of(&get("/fonts/a.woff2"), false), AssetClass::Other);
    assert_eq!(
      AssetClass::of(&Request::navigate(Url::parse("https://dream.example/x.css").unwrap()), false),
      AssetClass::Navigation
    );
  }

  #[test]
  fn test_stubs_are_typed() {
    assert_eq!(stub(AssetClass::Stylesheet).header("content-type"), Some("text/css"));
    assert!(stub(AssetClass::Script).body.is_empty());

    let gif = stub(AssetClass::Image);
    assert_eq!(gif.header("content-type"), Some("image/gif"));
    assert!(gif.body.starts_with(b"GIF89a"));

    assert_eq!(stub(AssetClass::Other).status, 503);
  }

  #[test]
  fn test_api_unavailable_body() {
    let resp = api_unavailable();
    assert_eq!(resp.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(body["error"], "Network error and no cache available");
    assert_eq!(body["offline"], true);
  }

  #[test]
  fn test_offline_page_is_html() {
    let page = offline_page();
    assert!(page.header("content-type").unwrap().starts_with("text/html"));
    assert!(String::from_utf8_lossy(&page.body).contains("offline"));
  }
}
