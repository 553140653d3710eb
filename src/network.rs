//! Network access behind a trait so strategies can run without a real origin.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::http::{Headers, Request, Response};

/// A boxed, sendable future
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("network unavailable: {0}")]
  Unavailable(String),

  #[error("request timed out")]
  Timeout,
}

/// Something that can perform a request against the origin.
///
/// The returned future owns everything it needs so it can be moved onto a
/// background task and outlive the caller.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: Request) -> BoxFuture<Result<Response, NetworkError>>;
}

/// reqwest-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  token: Option<String>,
}

impl HttpNetwork {
  /// The connect timeout is the network deadline. Slow responses on an open
  /// connection are left to the strategies, which keep them running past it.
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("dreamsw/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(config.cache.network_timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      token: Config::get_api_token(),
    })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<Result<Response, NetworkError>> {
    let client = self.client.clone();
    let token = self.token.clone();

    Box::pin(async move {
      let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|e| NetworkError::Unavailable(e.to_string()))?;

      let mut builder = client.request(method, request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(token) = token {
        builder = builder.bearer_auth(token);
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
          NetworkError::Timeout
        } else {
          NetworkError::Unavailable(e.to_string())
        }
      })?;

      let status = response.status().as_u16();
      let headers: Headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| NetworkError::Unavailable(e.to_string()))?;

      debug!(url = %request.url, status, "network response");

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_client_builds_from_config() {
    let mut config = Config::default();
    config.cache.network_timeout_ms = 250;
    assert!(HttpNetwork::new(&config).is_ok());
  }
}
