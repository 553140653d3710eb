//! Offline mutation queue.
//!
//! Mutating bridge calls that fail for lack of connectivity are persisted
//! here and replayed, oldest first per endpoint, when a sync trigger fires.

mod replay;
mod store;

pub use replay::{ReplayOutcome, ReplayReport, ReplayResult, ReplayTrigger, Replayer};
pub use store::{MutationQueue, MutationStatus, NewMutation, QueueCounts, QueuedMutation};
