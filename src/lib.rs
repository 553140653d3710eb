//! Offline response cache and mutation replay engine.
//!
//! [`engine::Engine`] is the entry point: hosts feed it lifecycle, fetch,
//! sync, push and message events and act on the actions it returns.

pub mod background;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod logging;
pub mod network;
pub mod notify;
pub mod push;
pub mod queue;
pub mod router;
pub mod strategy;

#[cfg(test)]
mod testing;
