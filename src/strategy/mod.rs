//! Strategy executors.
//!
//! Every executor ends in a response: a network answer, a cached copy, or a
//! generated fallback. Nothing here returns an error to the caller.

pub mod fallback;

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use self::fallback::AssetClass;
use crate::background::BackgroundTasks;
use crate::cache::{CacheManager, CacheResult, CacheSource, StoredResponse};
use crate::config::Config;
use crate::db::Database;
use crate::error::EngineError;
use crate::http::{CacheMode, Method, Request, RequestKey, Response};
use crate::network::{Network, NetworkError};
use crate::notify::{Notifier, ServerMessage};
use crate::queue::{MutationQueue, NewMutation};
use crate::router::{Router, Strategy};

/// How the engine will handle a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
  /// Not intercepted
  Passthrough,
  Run(Strategy),
  /// Mutating bridge call: sent now, queued if the network fails
  QueueOnFailure,
}

/// Where a network response is stored once it arrives
#[derive(Debug, Clone)]
enum StoreTarget {
  Namespace(String),
  /// Bridge responses also mark the last successful sync
  Bridge(String),
}

pub struct Executor {
  cache: Arc<CacheManager>,
  network: Arc<dyn Network>,
  queue: Arc<MutationQueue>,
  db: Arc<Database>,
  notifier: Arc<Notifier>,
  tasks: BackgroundTasks,
  router: Router,
  offline_page: RequestKey,
  network_timeout: Duration,
  bridge_timeout: Duration,
}

impl Executor {
  pub fn new(
    cache: Arc<CacheManager>,
    network: Arc<dyn Network>,
    queue: Arc<MutationQueue>,
    db: Arc<Database>,
    notifier: Arc<Notifier>,
    tasks: BackgroundTasks,
    config: &Config,
  ) -> Result<Self> {
    Ok(Self {
      router: Router::new(&config.routing)?,
      offline_page: RequestKey::get(&config.offline_page_url()?),
      network_timeout: config.cache.network_timeout(),
      bridge_timeout: config.cache.bridge_timeout(),
      cache,
      network,
      queue,
      db,
      notifier,
      tasks,
    })
  }

  pub fn plan(&self, request: &Request) -> Plan {
    if request.method == Method::Get && request.cache_mode == CacheMode::OnlyIfCached {
      return Plan::Run(Strategy::CacheOnly);
    }
    match self.router.classify(request) {
      Strategy::Bypass if self.router.is_queueable(request) => Plan::QueueOnFailure,
      Strategy::Bypass => Plan::Passthrough,
      strategy => Plan::Run(strategy),
    }
  }

  /// Plan and run. `None` means the request is not intercepted.
  pub async fn handle(&self, request: Request) -> Option<CacheResult<Response>> {
    let plan = self.plan(&request);
    debug!(method = %request.method, url = %request.url, ?plan, "fetch");
    match plan {
      Plan::Passthrough => None,
      Plan::Run(strategy) => Some(self.execute(strategy, request).await),
      Plan::QueueOnFailure => Some(self.queue_on_failure(request).await),
    }
  }

  pub async fn execute(&self, strategy: Strategy, request: Request) -> CacheResult<Response> {
    match strategy {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::NetworkOnly => self.network_only(request).await,
      Strategy::CacheOnly => self.cache_only(&request),
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
      Strategy::Bypass => match self.network.fetch(request).await {
        Ok(response) => CacheResult::from_network(response),
        Err(_) => CacheResult::fallback(Response::error()),
      },
    }
  }

  /// Cache, then network, then a stub for the asset class.
  pub async fn cache_first(&self, request: Request) -> CacheResult<Response> {
    let key = request.key();
    let namespace = self.cache.static_namespace().to_string();

    if let Some(hit) = self.cache.lookup(&key) {
      let result = self.from_cache(&hit);
      if result.source == CacheSource::CacheStale {
        self.revalidate(request, StoreTarget::Namespace(namespace));
      }
      return result;
    }

    let class = self.asset_class(&request);
    match self.network.fetch(request).await {
      Ok(response) => {
        self.cache.store(&namespace, &key, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(%key, error = %e, "cache miss and network failed");
        CacheResult::fallback(fallback::stub(class))
      }
    }
  }

  /// Network within the deadline, then cache, then the offline page or a stub.
  pub async fn network_first(&self, request: Request) -> CacheResult<Response> {
    let key = request.key();
    let class = self.asset_class(&request);
    let target = StoreTarget::Namespace(self.cache.dynamic_namespace().to_string());

    match self
      .fetch_with_deadline(request, target, self.network_timeout)
      .await
    {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        debug!(%key, error = %e, "network-first falling back to cache");
        if let Some(hit) = self.cache.lookup(&key) {
          return CacheResult::offline(hit.to_response(), hit.stored_at);
        }
        self.offline_fallback(class)
      }
    }
  }

  /// Network only. Never cached.
  pub async fn network_only(&self, request: Request) -> CacheResult<Response> {
    let always_fresh = self.router.is_always_fresh(&request);
    match self.network.fetch(request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        debug!(error = %e, "network-only request failed");
        if always_fresh {
          CacheResult::fallback(fallback::offline_page())
        } else {
          CacheResult::fallback(Response::new(503))
        }
      }
    }
  }

  /// Cache only. Never touches the network.
  pub fn cache_only(&self, request: &Request) -> CacheResult<Response> {
    match self.cache.lookup(&request.key()) {
      Some(hit) => self.from_cache(&hit),
      None => CacheResult::fallback(fallback::not_cached()),
    }
  }

  /// Cached copy now and a refresh in the background; on a miss, the network
  /// within the bridge deadline, then a 503 JSON body.
  pub async fn stale_while_revalidate(&self, request: Request) -> CacheResult<Response> {
    let key = request.key();
    let target = StoreTarget::Bridge(self.cache.dynamic_namespace().to_string());

    if let Some(hit) = self.cache.lookup(&key) {
      self.revalidate(request, target);
      return self.from_cache(&hit);
    }

    match self
      .fetch_with_deadline(request, target, self.bridge_timeout)
      .await
    {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        debug!(%key, error = %e, "bridge unavailable and nothing cached");
        CacheResult::fallback(fallback::api_unavailable())
      }
    }
  }

  /// Send a mutation; if the network fails, queue it and answer 202.
  ///
  /// Any response from the origin, even an error status, is passed through:
  /// only a missing network defers the mutation. When the deadline passes first
  /// the send keeps running and the queued copy is held in flight until it
  /// settles, so a late delivery is never replayed.
  pub async fn queue_on_failure(&self, request: Request) -> CacheResult<Response> {
    let mutation = NewMutation::from_request(&request);
    let (tx, rx) = oneshot::channel();
    let (held_tx, held_rx) = oneshot::channel::<i64>();
    let fetch = self.network.fetch(request);
    let queue = Arc::clone(&self.queue);

    self.tasks.submit("mutation-fetch", async move {
      let result = fetch.await;
      let sent = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
      let _ = tx.send(result);
      // Only receives an id when the caller stopped waiting and queued the mutation
      if let Ok(id) = held_rx.await {
        settle_late_send(&queue, id, sent);
      }
    });

    let (err, held) = match tokio::time::timeout(self.network_timeout, rx).await {
      Ok(Ok(Ok(response))) => return CacheResult::from_network(response),
      Ok(Ok(Err(e))) => (EngineError::from(e), false),
      Ok(Err(_)) => (
        NetworkError::Unavailable("fetch task dropped".to_string()).into(),
        false,
      ),
      Err(_) => (NetworkError::Timeout.into(), true),
    };

    debug!(url = %mutation.url, error = %err, "mutation failed, queueing");
    let queued = if held {
      self.queue.enqueue_in_flight(mutation)
    } else {
      self.queue.enqueue(mutation)
    };
    match queued {
      Ok(queued) => {
        if held && held_tx.send(queued.id).is_err() {
          settle_late_send(&self.queue, queued.id, Err("fetch task dropped".to_string()));
        }
        self.notifier.broadcast(ServerMessage::MutationQueued {
          id: queued.id,
          url: queued.url.clone(),
        });
        CacheResult::queued(fallback::queued(queued.id))
      }
      Err(e) => {
        warn!(error = %e, "could not queue mutation");
        CacheResult::fallback(fallback::api_unavailable())
      }
    }
  }

  fn from_cache(&self, hit: &StoredResponse) -> CacheResult<Response> {
    CacheResult::from_cache(
      hit.to_response(),
      hit.stored_at,
      self.cache.is_stale(hit.stored_at),
    )
  }

  fn asset_class(&self, request: &Request) -> AssetClass {
    AssetClass::of(request, self.router.is_bridge(request))
  }

  /// Cached offline page for navigations, otherwise the stub for the class.
  fn offline_fallback(&self, class: AssetClass) -> CacheResult<Response> {
    if class == AssetClass::Navigation {
      if let Some(page) = self.cache.lookup(&self.offline_page) {
        return CacheResult::offline(page.to_response(), page.stored_at);
      }
    }
    CacheResult::fallback(fallback::stub(class))
  }

  /// Race the network against `deadline`.
  ///
  /// The fetch runs as its own background task and is never cancelled: a
  /// response arriving after the deadline is still stored in `target`.
  async fn fetch_with_deadline(
    &self,
    request: Request,
    target: StoreTarget,
    deadline: Duration,
  ) -> Result<Response, EngineError> {
    let (tx, rx) = oneshot::channel();
    let key = request.key();
    let fetch = self.network.fetch(request);
    let cache = Arc::clone(&self.cache);
    let db = Arc::clone(&self.db);

    self.tasks.submit("network-fetch", async move {
      let result = fetch.await;
      if let Ok(response) = &result {
        store_response(&cache, &db, &target, &key, response);
      }
      if tx.send(result).is_err() {
        debug!(%key, "network answered after the deadline");
      }
    });

    match tokio::time::timeout(deadline, rx).await {
      Ok(Ok(result)) => result.map_err(EngineError::from),
      Ok(Err(_)) => Err(NetworkError::Unavailable("fetch task dropped".to_string()).into()),
      Err(_) => Err(NetworkError::Timeout.into()),
    }
  }

  fn revalidate(&self, request: Request, target: StoreTarget) {
    let key = request.key();
    let fetch = self.network.fetch(request);
    let cache = Arc::clone(&self.cache);
    let db = Arc::clone(&self.db);

    self.tasks.submit("revalidate", async move {
      match fetch.await {
        Ok(response) => store_response(&cache, &db, &target, &key, &response),
        Err(e) => debug!(%key, error = %e, "background refresh failed"),
      }
    });
  }
}

fn store_response(
  cache: &CacheManager,
  db: &Database,
  target: &StoreTarget,
  key: &RequestKey,
  response: &Response,
) {
  match target {
    StoreTarget::Namespace(namespace) => {
      cache.store(namespace, key, response);
    }
    StoreTarget::Bridge(namespace) => {
      cache.store(namespace, key, response);
      if response.ok() {
        if let Err(e) = db.record_sync(Utc::now()) {
          warn!(error = %e, "could not record sync time");
        }
      }
    }
  }
}

/// Resolve a queued mutation whose first send finished after the client was
/// answered. Any origin response means it was delivered.
fn settle_late_send(queue: &MutationQueue, id: i64, sent: Result<(), String>) {
  let settled = match &sent {
    Ok(()) => queue.complete(id),
    Err(reason) => queue.fail(id, reason).map(|_| ()),
  };
  match settled {
    Ok(()) => debug!(id, delivered = sent.is_ok(), "late mutation send settled"),
    Err(e) => warn!(id, error = %e, "could not settle late mutation send"),
  }
}
