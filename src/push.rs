//! Push message rendering and notification click handling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PushConfig;

/// Fields a push sender may set. Everything else comes from defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

impl PushPayload {
  /// Parse push data. Missing or malformed data yields an empty payload.
  pub fn parse(data: Option<&[u8]>) -> Self {
    let Some(data) = data else {
      return Self::default();
    };
    serde_json::from_slice(data).unwrap_or_else(|e| {
      debug!(error = %e, "ignoring malformed push payload");
      Self::default()
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationData {
  pub url: String,
  pub timestamp: DateTime<Utc>,
}

/// A notification ready to be shown by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub actions: Vec<NotificationAction>,
  pub data: NotificationData,
}

pub const ACTION_OPEN: &str = "open";
pub const ACTION_CLOSE: &str = "close";

pub fn render(payload: PushPayload, config: &PushConfig, now: DateTime<Utc>) -> Notification {
  Notification {
    title: payload
      .title
      .unwrap_or_else(|| config.default_title.clone()),
    body: payload.body.unwrap_or_else(|| config.default_body.clone()),
    icon: config.icon.clone(),
    badge: config.badge.clone(),
    vibrate: vec![100, 50, 100],
    actions: vec![
      NotificationAction {
        action: ACTION_OPEN.to_string(),
        title: "Open App".to_string(),
      },
      NotificationAction {
        action: ACTION_CLOSE.to_string(),
        title: "Close".to_string(),
      },
    ],
    data: NotificationData {
      url: payload.url.unwrap_or_else(|| "/".to_string()),
      timestamp: now,
    },
  }
}

/// What to do after a notification was clicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickResolution {
  /// Focus an open window and navigate it, or open a new one
  FocusOrOpen { url: String },
  Dismiss,
}

/// The default action (empty) behaves like `open`.
pub fn resolve_click(action: &str, url: &str) -> ClickResolution {
  match action {
    "" | ACTION_OPEN => ClickResolution::FocusOrOpen {
      url: url.to_string(),
    },
    _ => ClickResolution::Dismiss,
  }
}
