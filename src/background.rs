//! Fire-and-forget work that continues after a response has been delivered.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct Inner {
  pending: AtomicUsize,
  completed: AtomicU64,
  idle: Notify,
}

/// Spawns background tasks and tracks them until they finish.
///
/// Revalidation, late network races and seeding run here so the response
/// path never waits on them. [`BackgroundTasks::wait_idle`] lets tests and the
/// CLI wait for everything to settle.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
  inner: Arc<Inner>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn submit<F>(&self, name: &'static str, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.inner.pending.fetch_add(1, Ordering::SeqCst);
    let done = Completion(Arc::clone(&self.inner));

    tokio::spawn(async move {
      let _done = done;
      task.await;
      debug!(task = name, "background task finished");
    });
  }

  /// Tasks submitted and not yet finished.
  pub fn pending(&self) -> usize {
    self.inner.pending.load(Ordering::SeqCst)
  }

  pub fn completed(&self) -> u64 {
    self.inner.completed.load(Ordering::SeqCst)
  }

  /// Wait until no task is pending, including tasks submitted meanwhile.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.inner.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if self.pending() == 0 {
        return;
      }
      notified.await;
    }
  }
}

/// Decrements the pending count when the task ends, even by panic.
struct Completion(Arc<Inner>);

impl Drop for Completion {
  fn drop(&mut self) {
    self.0.completed.fetch_add(1, Ordering::SeqCst);
    if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.0.idle.notify_waiters();
    }
  }
}
