//! Response cache organised in versioned generations.
//!
//! This module provides:
//! - Named cache generations persisted in SQLite
//! - Best-effort seeding from a URL list
//! - Purging of generations that are no longer current
//! - Success-only stores that never fail the caller

mod manager;
mod storage;
mod types;

pub use manager::CacheManager;
pub use storage::{CacheStorage, NamespaceUsage, SqliteStorage, StoreError};
pub use types::{
  CacheResult, CacheSource, CacheStatus, NamespaceStatus, SeedFailure, SeedReport, StoredResponse,
};
