//! Failure taxonomy of the engine.
//!
//! None of these reach the interception boundary: every fetch path ends in a
//! cached value, a generated fallback, or a well-formed error response. They
//! exist so the failure paths can be logged and reported with a precise kind.

use thiserror::Error;

use crate::cache::StoreError;
use crate::network::NetworkError;

#[derive(Debug, Error)]
pub enum EngineError {
  /// Some seed URLs could not be fetched or stored. Install still succeeds.
  #[error("seeding {namespace}: {failed} of {total} urls failed")]
  SeedPartialFailure {
    namespace: String,
    failed: usize,
    total: usize,
  },

  /// Network could not be reached; triggers the fallback chain.
  #[error(transparent)]
  NetworkUnavailable(#[from] NetworkError),

  /// Cache storage is full; the store is skipped.
  #[error("storage quota exceeded")]
  QuotaExceeded,

  /// A queued mutation could not be replayed; it stays queued.
  #[error("replay of mutation {id} failed: {reason}")]
  ReplayFailure { id: i64, reason: String },

  /// A client message the engine does not understand; it is ignored.
  #[error("unknown command: {0}")]
  UnknownCommand(String),

  #[error("storage error: {0}")]
  Storage(String),
}

impl From<StoreError> for EngineError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::QuotaExceeded => Self::QuotaExceeded,
      other => Self::Storage(other.to_string()),
    }
  }
}
