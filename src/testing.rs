//! Scripted network used by the unit tests.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::http::{Method, Request, Response};
use crate::network::{BoxFuture, Network, NetworkError};

#[derive(Clone)]
struct Route {
  status: u16,
  body: Bytes,
  delay: Duration,
  /// Drop the connection after `delay` instead of answering
  reset: bool,
}

#[derive(Default)]
struct FakeState {
  routes: HashMap<String, Route>,
  /// Extra latency keyed by request body, to reorder otherwise identical calls
  body_delays: HashMap<Bytes, Duration>,
  offline: bool,
  started: Vec<(Method, String)>,
  completed: Vec<(Method, String, Bytes)>,
}

/// In-process origin. Unrouted paths answer 404.
#[derive(Clone, Default)]
pub struct FakeNetwork {
  state: Arc<Mutex<FakeState>>,
}

impl FakeNetwork {
  pub const ORIGIN: &'static str = "https://dream.example";

  pub fn new() -> Self {
    Self::default()
  }

  pub fn url(path: &str) -> Url {
    Url::parse(Self::ORIGIN).unwrap().join(path).unwrap()
  }

  pub fn route(&self, path: &str, status: u16, body: &str) {
    self.route_delayed(path, status, body, Duration::ZERO);
  }

  pub fn route_delayed(&self, path: &str, status: u16, body: &str, delay: Duration) {
    self.state.lock().unwrap().routes.insert(
      path.to_string(),
      Route {
        status,
        body: Bytes::from(body.to_string()),
        delay,
        reset: false,
      },
    );
  }

  /// Requests to `path` hang for `delay`, then fail with a network error.
  pub fn route_reset(&self, path: &str, delay: Duration) {
    self.state.lock().unwrap().routes.insert(
      path.to_string(),
      Route {
        status: 0,
        body: Bytes::new(),
        delay,
        reset: true,
      },
    );
  }

  pub fn delay_body(&self, body: &str, delay: Duration) {
    self
      .state
      .lock()
      .unwrap()
      .body_delays
      .insert(Bytes::from(body.to_string()), delay);
  }

  pub fn set_offline(&self, offline: bool) {
    self.state.lock().unwrap().offline = offline;
  }

  /// Number of fetches started for `path`.
  pub fn calls(&self, path: &str) -> usize {
    self
      .state
      .lock()
      .unwrap()
      .started
      .iter()
      .filter(|(_, p)| p == path)
      .count()
  }

  /// Bodies of completed requests, in completion order.
  pub fn completed_bodies(&self) -> Vec<String> {
    self
      .state
      .lock()
      .unwrap()
      .completed
      .iter()
      .map(|(_, _, body)| String::from_utf8_lossy(body).into_owned())
      .collect()
  }
}

impl Network for FakeNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<Result<Response, NetworkError>> {
    let state = Arc::clone(&self.state);

    Box::pin(async move {
      let path = request.url.path().to_string();
      let body = request.body.clone().unwrap_or_default();

      let (route, extra, offline) = {
        let mut state = state.lock().unwrap();
        state.started.push((request.method, path.clone()));
        (
          state.routes.get(&path).cloned(),
          state.body_delays.get(&body).copied().unwrap_or_default(),
          state.offline,
        )
      };

      if offline {
        return Err(NetworkError::Unavailable("offline".to_string()));
      }

      let route = route.unwrap_or(Route {
        status: 404,
        body: Bytes::from_static(b"not found"),
        delay: Duration::ZERO,
        reset: false,
      });

      let delay = route.delay + extra;
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      if route.reset {
        return Err(NetworkError::Unavailable("connection reset".to_string()));
      }

      state
        .lock()
        .unwrap()
        .completed
        .push((request.method, path, body));

      Ok(Response::text(route.status, "text/plain", route.body))
    })
  }
}
