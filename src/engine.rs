//! Event dispatch.
//!
//! The host feeds [`EngineEvent`]s in and carries out the [`EngineAction`]s
//! that come back. Every event ends in an action; failures along the way are
//! logged and absorbed.

use bytes::Bytes;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::background::BackgroundTasks;
use crate::cache::{CacheManager, CacheResult, SeedReport, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::error::EngineError;
use crate::http::{Headers, Method, Request, Response};
use crate::network::Network;
use crate::notify::{ClientId, Notifier, ServerMessage};
use crate::push::{self, ClickResolution, Notification, PushPayload};
use crate::queue::{MutationQueue, NewMutation, ReplayReport, ReplayTrigger, Replayer};
use crate::strategy::Executor;

const LIFECYCLE_KEY: &str = "lifecycle_phase";

/// Lifecycle phase of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Installing,
  /// Seeded, waiting to be activated
  Installed,
  Activating,
  /// Intercepting fetches
  Active,
}

impl Phase {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
    }
  }
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Phase {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "installing" => Ok(Self::Installing),
      "installed" => Ok(Self::Installed),
      "activating" => Ok(Self::Activating),
      "active" => Ok(Self::Active),
      other => Err(eyre!("Unknown lifecycle phase: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
  pub phase: Phase,
  /// A client asked to activate as soon as installation finishes
  pub skip_waiting: bool,
}

/// Something the host reports to the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
  Install,
  Activate,
  Fetch(Request),
  /// Background sync fired for `tag`
  Sync { tag: String },
  PeriodicSync { tag: String },
  /// Push message with its raw data, if any
  Push(Option<Bytes>),
  NotificationClick { action: String, url: String },
  Message { client: ClientId, payload: Value },
}

/// What the host should do in response to an event
#[derive(Debug, Clone)]
pub enum EngineAction {
  None,
  Installed(SeedReport),
  Activated { purged: Vec<String> },
  Respond(CacheResult<Response>),
  /// Not intercepted; the host performs the request itself
  Passthrough,
  Synced(ReplayReport),
  ShowNotification(Notification),
  FocusOrOpen { url: String },
}

/// Commands clients may send over the message channel
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum ClientCommand {
  SkipWaiting,
  GetCacheStatus,
  ClearCache,
  TriggerSync,
  QueueData {
    url: String,
    #[serde(default)]
    method: Option<Method>,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    body: Option<String>,
  },
  GetSyncStatus,
}

impl ClientCommand {
  const KNOWN: [&'static str; 6] = [
    "SKIP_WAITING",
    "GET_CACHE_STATUS",
    "CLEAR_CACHE",
    "TRIGGER_SYNC",
    "QUEUE_DATA",
    "GET_SYNC_STATUS",
  ];

  fn parse(payload: Value) -> Result<Self, EngineError> {
    let kind = payload
      .get("type")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();

    serde_json::from_value(payload).map_err(|e| {
      if Self::KNOWN.contains(&kind.as_str()) {
        EngineError::UnknownCommand(format!("malformed {}: {}", kind, e))
      } else {
        EngineError::UnknownCommand(kind)
      }
    })
  }
}

pub struct Engine {
  config: Config,
  db: Arc<Database>,
  cache: Arc<CacheManager>,
  queue: Arc<MutationQueue>,
  notifier: Arc<Notifier>,
  tasks: BackgroundTasks,
  executor: Executor,
  replayer: Replayer,
  /// Activation takes the write side, fetches the read side
  lifecycle: RwLock<Lifecycle>,
}

impl Engine {
  pub fn new(config: Config, db: Arc<Database>, network: Arc<dyn Network>) -> Result<Self> {
    let storage =
      SqliteStorage::new(Arc::clone(&db)).with_max_bytes(config.cache.max_bytes);
    let cache = Arc::new(CacheManager::new(
      Arc::new(storage),
      Arc::clone(&network),
      &config.cache,
    ));
    let queue = Arc::new(MutationQueue::new(Arc::clone(&db))?);
    let notifier = Arc::new(Notifier::new());
    let tasks = BackgroundTasks::new();

    let executor = Executor::new(
      Arc::clone(&cache),
      Arc::clone(&network),
      Arc::clone(&queue),
      Arc::clone(&db),
      Arc::clone(&notifier),
      tasks.clone(),
      &config,
    )?;
    let replayer = Replayer::new(
      Arc::clone(&queue),
      network,
      Arc::clone(&db),
      config.sync.replay_timeout(),
    );

    let phase = match db.get_state(LIFECYCLE_KEY)? {
      Some(stored) => stored.parse::<Phase>().unwrap_or_else(|e| {
        warn!(error = %e, "ignoring stored lifecycle phase");
        Phase::Installing
      }),
      None => Phase::Installing,
    };
    debug!(%phase, "engine ready");

    Ok(Self {
      config,
      db,
      cache,
      queue,
      notifier,
      tasks,
      executor,
      replayer,
      lifecycle: RwLock::new(Lifecycle {
        phase,
        skip_waiting: false,
      }),
    })
  }

  pub async fn handle(&self, event: EngineEvent) -> EngineAction {
    match event {
      EngineEvent::Install => self.install().await,
      EngineEvent::Activate => self.activate().await,
      EngineEvent::Fetch(request) => self.fetch(request).await,
      EngineEvent::Sync { tag } => {
        if self.config.sync.tags.contains(&tag) {
          self.sync(ReplayTrigger::Connectivity { tag }).await
        } else {
          debug!(%tag, "ignoring unknown sync tag");
          EngineAction::None
        }
      }
      EngineEvent::PeriodicSync { tag } => {
        if tag == self.config.sync.periodic_tag {
          self.sync(ReplayTrigger::Periodic { tag }).await
        } else {
          debug!(%tag, "ignoring unknown periodic sync tag");
          EngineAction::None
        }
      }
      EngineEvent::Push(data) => {
        let payload = PushPayload::parse(data.as_deref());
        EngineAction::ShowNotification(push::render(payload, &self.config.push, Utc::now()))
      }
      EngineEvent::NotificationClick { action, url } => {
        match push::resolve_click(&action, &url) {
          ClickResolution::FocusOrOpen { url } => EngineAction::FocusOrOpen { url },
          ClickResolution::Dismiss => EngineAction::None,
        }
      }
      EngineEvent::Message { client, payload } => self.message(client, payload).await,
    }
  }

  async fn install(&self) -> EngineAction {
    {
      let mut lifecycle = self.lifecycle.write().await;
      if lifecycle.phase != Phase::Active {
        lifecycle.phase = Phase::Installing;
      }
    }

    let urls = self.config.seed_urls().unwrap_or_else(|e| {
      warn!(error = %e, "invalid seed list, seeding nothing");
      Vec::new()
    });
    let report = self.cache.seed(self.cache.static_namespace(), &urls).await;

    let activate_now = {
      let mut lifecycle = self.lifecycle.write().await;
      if lifecycle.phase != Phase::Active {
        lifecycle.phase = Phase::Installed;
        self.persist_phase(Phase::Installed);
      }
      lifecycle.phase == Phase::Installed && lifecycle.skip_waiting
    };
    info!(
      stored = report.stored.len(),
      failed = report.failures.len(),
      "installed"
    );

    if activate_now {
      self.activate().await;
    }
    EngineAction::Installed(report)
  }

  async fn activate(&self) -> EngineAction {
    let purged = {
      let mut lifecycle = self.lifecycle.write().await;
      lifecycle.phase = Phase::Activating;

      let current = self.cache.current_namespaces();
      let purged = self.cache.purge_stale(&current).unwrap_or_else(|e| {
        warn!(error = %EngineError::from(e), "could not purge stale generations");
        Vec::new()
      });
      for namespace in &current {
        if let Err(e) = self.cache.open(namespace) {
          warn!(namespace, error = %e, "could not open generation");
        }
      }

      lifecycle.phase = Phase::Active;
      lifecycle.skip_waiting = false;
      self.persist_phase(Phase::Active);
      purged
    };

    info!(purged = purged.len(), "activated");
    self.notifier.broadcast(ServerMessage::ActivationComplete {
      purged: purged.clone(),
    });
    EngineAction::Activated { purged }
  }

  async fn fetch(&self, request: Request) -> EngineAction {
    let lifecycle = self.lifecycle.read().await;
    if lifecycle.phase != Phase::Active {
      debug!(phase = %lifecycle.phase, url = %request.url, "not active, passing through");
      return EngineAction::Passthrough;
    }

    match self.executor.handle(request).await {
      Some(result) => EngineAction::Respond(result),
      None => EngineAction::Passthrough,
    }
  }

  async fn sync(&self, trigger: ReplayTrigger) -> EngineAction {
    match self.replayer.replay(trigger).await {
      Ok(report) => {
        self.notifier.broadcast(ServerMessage::SyncComplete {
          results: report.results.clone(),
        });
        EngineAction::Synced(report)
      }
      Err(e) => {
        warn!(error = %e, "replay failed");
        EngineAction::None
      }
    }
  }

  async fn message(&self, client: ClientId, payload: Value) -> EngineAction {
    let command = match ClientCommand::parse(payload) {
      Ok(command) => command,
      Err(e) => {
        debug!(%client, error = %e, "ignoring client message");
        return EngineAction::None;
      }
    };
    debug!(%client, ?command, "client command");

    match command {
      ClientCommand::SkipWaiting => {
        let activate_now = {
          let mut lifecycle = self.lifecycle.write().await;
          lifecycle.skip_waiting = true;
          lifecycle.phase == Phase::Installed
        };
        if activate_now {
          return self.activate().await;
        }
      }
      ClientCommand::GetCacheStatus => match self.cache.status() {
        Ok(status) => {
          self
            .notifier
            .reply(client, ServerMessage::CacheStatus(status));
        }
        Err(e) => warn!(error = %e, "could not read cache status"),
      },
      ClientCommand::ClearCache => match self.cache.clear() {
        Ok(namespaces) => {
          self
            .notifier
            .broadcast(ServerMessage::CacheCleared { namespaces });
        }
        Err(e) => warn!(error = %e, "could not clear caches"),
      },
      ClientCommand::TriggerSync => {
        return self.sync(ReplayTrigger::Client { client }).await;
      }
      ClientCommand::QueueData {
        url,
        method,
        headers,
        body,
      } => {
        if let Err(e) = self.queue_data(&url, method.unwrap_or(Method::Post), headers, body) {
          warn!(%client, error = %e, "could not queue client data");
        }
      }
      ClientCommand::GetSyncStatus => match self.sync_status() {
        Ok(status) => {
          self.notifier.reply(client, status);
        }
        Err(e) => warn!(error = %e, "could not read sync status"),
      },
    }
    EngineAction::None
  }

  fn queue_data(
    &self,
    url: &str,
    method: Method,
    headers: Headers,
    body: Option<String>,
  ) -> Result<()> {
    let mutation = NewMutation {
      url: self.config.resolve(url)?,
      method,
      headers,
      body: body.map(Bytes::from),
    };
    let queued = self.queue.enqueue(mutation)?;
    self.notifier.broadcast(ServerMessage::MutationQueued {
      id: queued.id,
      url: queued.url,
    });
    Ok(())
  }

  pub fn sync_status(&self) -> Result<ServerMessage> {
    let counts = self.queue.count_by_status()?;
    Ok(ServerMessage::SyncStatus {
      pending: counts.pending + counts.in_flight,
      failed: counts.failed,
      last_sync: self.db.last_sync()?,
    })
  }

  fn persist_phase(&self, phase: Phase) {
    if let Err(e) = self.db.set_state(LIFECYCLE_KEY, phase.as_str()) {
      warn!(%phase, error = %e, "could not persist lifecycle phase");
    }
  }

  pub async fn lifecycle(&self) -> Lifecycle {
    *self.lifecycle.read().await
  }

  pub fn connect(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
    self.notifier.connect()
  }

  pub fn disconnect(&self, client: ClientId) {
    self.notifier.disconnect(client)
  }

  pub fn tasks(&self) -> &BackgroundTasks {
    &self.tasks
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn config(&self) -> &Config {
    &self.config
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::http::RequestKey;
  use crate::testing::FakeNetwork;
  use serde_json::json;

  fn config() -> Config {
    Config {
      origin: FakeNetwork::ORIGIN.to_string(),
      ..Config::default()
    }
  }

  fn engine_with(config: Config, network: &FakeNetwork) -> Engine {
    let db = Arc::new(Database::open_in_memory().unwrap());
    Engine::new(config, db, Arc::new(network.clone())).unwrap()
  }

  async fn active_engine(network: &FakeNetwork) -> Engine {
    let engine = engine_with(config(), network);
    engine.handle(EngineEvent::Activate).await;
    engine
  }

  fn message(client: ClientId, payload: Value) -> EngineEvent {
    EngineEvent::Message { client, payload }
  }

  #[tokio::test]
  async fn test_seed_scenario_and_cache_status() {
    let network = FakeNetwork::new();
    network.route("/a", 200, "a");
    network.route("/b", 200, "b");
    network.route("/missing", 404, "gone");
    network.route("/offline.html", 200, "<h1>offline</h1>");

    let mut config = config();
    config.cache.seed_urls = vec!["/a".into(), "/missing".into(), "/b".into()];
    let engine = engine_with(config, &network);

    let EngineAction::Installed(report) = engine.handle(EngineEvent::Install).await else {
      panic!("expected Installed");
    };
    assert_eq!(report.stored.len(), 3);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].url.ends_with("/missing"));
    assert_eq!(engine.lifecycle().await.phase, Phase::Installed);

    let keys: Vec<String> = engine
      .cache()
      .keys("dreamos-static-v4")
      .unwrap()
      .into_iter()
      .map(|k| k.url)
      .collect();
    assert!(keys.contains(&FakeNetwork::url("/a").to_string()));
    assert!(keys.contains(&FakeNetwork::url("/b").to_string()));
    assert!(!keys.contains(&FakeNetwork::url("/missing").to_string()));

    engine.handle(EngineEvent::Activate).await;
    let (client, mut rx) = engine.connect();
    let action = engine
      .handle(message(client, json!({"type": "GET_CACHE_STATUS"})))
      .await;
    assert!(matches!(action, EngineAction::None));

    match rx.try_recv().unwrap() {
      ServerMessage::CacheStatus(status) => {
        assert!(status.generations.contains(&"dreamos-static-v4".to_string()));
        let ns = status
          .namespaces
          .iter()
          .find(|n| n.name == "dreamos-static-v4")
          .unwrap();
        assert!(ns.current);
        assert_eq!(ns.entries, 3);
      }
      other => panic!("unexpected message: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_activation_purges_old_generations() {
    let network = FakeNetwork::new();
    let engine = engine_with(config(), &network);
    engine.cache().open("dreamos-static-v3").unwrap();
    engine.cache().store(
      "dreamos-static-v3",
      &RequestKey::get(&FakeNetwork::url("/old.css")),
      &Response::text(200, "text/css", ""),
    );
    let (_, mut rx) = engine.connect();

    let EngineAction::Activated { purged } = engine.handle(EngineEvent::Activate).await else {
      panic!("expected Activated");
    };
    assert_eq!(purged, vec!["dreamos-static-v3".to_string()]);
    assert!(matches!(
      rx.try_recv(),
      Ok(ServerMessage::ActivationComplete { .. })
    ));

    let status = engine.cache().status().unwrap();
    assert!(status.namespaces.iter().all(|n| n.current));
  }

  #[tokio::test]
  async fn test_fetch_passes_through_until_active() {
    let network = FakeNetwork::new();
    network.route("/css/main.css", 200, "a{}");
    let engine = engine_with(config(), &network);
    let request = Request::get(FakeNetwork::url("/css/main.css"));

    let before = engine.handle(EngineEvent::Fetch(request.clone())).await;
    assert!(matches!(before, EngineAction::Passthrough));

    engine.handle(EngineEvent::Activate).await;
    let EngineAction::Respond(result) = engine.handle(EngineEvent::Fetch(request)).await else {
      panic!("expected Respond");
    };
    assert_eq!(result.source, CacheSource::Network);
    engine.tasks().wait_idle().await;
  }

  #[tokio::test]
  async fn test_lifecycle_survives_restart() {
    let network = FakeNetwork::new();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let first = Engine::new(config(), Arc::clone(&db), Arc::new(network.clone())).unwrap();
    first.handle(EngineEvent::Activate).await;

    let second = Engine::new(config(), db, Arc::new(network)).unwrap();
    assert_eq!(second.lifecycle().await.phase, Phase::Active);
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_installed_worker() {
    let network = FakeNetwork::new();
    let engine = engine_with(config(), &network);
    engine.handle(EngineEvent::Install).await;
    let (client, _rx) = engine.connect();

    let action = engine
      .handle(message(client, json!({"type": "SKIP_WAITING"})))
      .await;
    assert!(matches!(action, EngineAction::Activated { .. }));
    assert_eq!(engine.lifecycle().await.phase, Phase::Active);
  }

  #[tokio::test]
  async fn test_offline_mutation_replayed_once() {
    let network = FakeNetwork::new();
    let engine = active_engine(&network).await;
    let (_, mut rx) = engine.connect();

    network.set_offline(true);
    let post = Request::new(Method::Post, FakeNetwork::url("/api/notes")).with_body("hello");
    let EngineAction::Respond(result) = engine.handle(EngineEvent::Fetch(post)).await else {
      panic!("expected Respond");
    };
    assert_eq!(result.data.status, 202);
    assert_eq!(engine.queue().list().unwrap().len(), 1);
    assert!(matches!(
      rx.try_recv(),
      Ok(ServerMessage::MutationQueued { .. })
    ));

    network.set_offline(false);
    network.route("/api/notes", 201, "created");
    let EngineAction::Synced(report) = engine
      .handle(EngineEvent::Sync {
        tag: "sync-offline-data".into(),
      })
      .await
    else {
      panic!("expected Synced");
    };
    assert_eq!(report.succeeded(), 1);
    assert!(engine.queue().list().unwrap().is_empty());
    assert!(matches!(
      rx.try_recv(),
      Ok(ServerMessage::SyncComplete { .. })
    ));

    let EngineAction::Synced(again) = engine
      .handle(EngineEvent::PeriodicSync {
        tag: "periodic-sync".into(),
      })
      .await
    else {
      panic!("expected Synced");
    };
    assert!(again.results.is_empty());
    engine.tasks().wait_idle().await;
  }

  #[tokio::test]
  async fn test_unknown_sync_tags_are_ignored() {
    let network = FakeNetwork::new();
    let engine = active_engine(&network).await;
    let action = engine
      .handle(EngineEvent::Sync {
        tag: "something-else".into(),
      })
      .await;
    assert!(matches!(action, EngineAction::None));
  }

  #[tokio::test]
  async fn test_queue_data_and_sync_status_reply() {
    let network = FakeNetwork::new();
    let engine = active_engine(&network).await;
    let (asker, mut asker_rx) = engine.connect();
    let (_, mut other_rx) = engine.connect();

    engine
      .handle(message(
        asker,
        json!({"type": "QUEUE_DATA", "url": "/api/notes", "body": "{\"n\":1}"}),
      ))
      .await;
    let queued = engine.queue().list().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].method, Method::Post);
    assert_eq!(queued[0].url, FakeNetwork::url("/api/notes").to_string());

    // Both saw the broadcast
    assert!(matches!(
      asker_rx.try_recv(),
      Ok(ServerMessage::MutationQueued { .. })
    ));
    assert!(matches!(
      other_rx.try_recv(),
      Ok(ServerMessage::MutationQueued { .. })
    ));

    engine
      .handle(message(asker, json!({"type": "GET_SYNC_STATUS"})))
      .await;
    match asker_rx.try_recv().unwrap() {
      ServerMessage::SyncStatus {
        pending,
        failed,
        last_sync,
      } => {
        assert_eq!(pending, 1);
        assert_eq!(failed, 0);
        assert!(last_sync.is_none());
      }
      other => panic!("unexpected message: {:?}", other),
    }
    assert!(other_rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_clear_cache_broadcasts() {
    let network = FakeNetwork::new();
    let engine = active_engine(&network).await;
    let (client, mut rx) = engine.connect();

    engine
      .handle(message(client, json!({"type": "CLEAR_CACHE"})))
      .await;
    match rx.try_recv().unwrap() {
      ServerMessage::CacheCleared { namespaces } => assert_eq!(namespaces.len(), 2),
      other => panic!("unexpected message: {:?}", other),
    }
    assert!(engine.cache().status().unwrap().namespaces.is_empty());
  }

  #[tokio::test]
  async fn test_unknown_and_malformed_messages_are_ignored() {
    let network = FakeNetwork::new();
    let engine = active_engine(&network).await;
    let (client, mut rx) = engine.connect();

    for payload in [
      json!({"type": "REBOOT"}),
      json!({"no": "type"}),
      json!({"type": "QUEUE_DATA"}),
      json!("GET_CACHE_STATUS"),
    ] {
      let action = engine.handle(message(client, payload)).await;
      assert!(matches!(action, EngineAction::None));
    }
    assert!(rx.try_recv().is_err());
    assert!(engine.queue().list().unwrap().is_empty());
  }

  #[test]
  fn test_command_parse_errors() {
    match ClientCommand::parse(json!({"type": "REBOOT"})) {
      Err(EngineError::UnknownCommand(kind)) => assert_eq!(kind, "REBOOT"),
      other => panic!("unexpected: {:?}", other),
    }
    match ClientCommand::parse(json!({"type": "QUEUE_DATA"})) {
      Err(EngineError::UnknownCommand(msg)) => assert!(msg.starts_with("malformed QUEUE_DATA")),
      other => panic!("unexpected: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_push_and_notification_click() {
    let network = FakeNetwork::new();
    let engine = active_engine(&network).await;

    let EngineAction::ShowNotification(n) = engine
      .handle(EngineEvent::Push(Some(Bytes::from_static(
        br#"{"title":"Hi","url":"/inbox"}"#,
      ))))
      .await
    else {
      panic!("expected ShowNotification");
    };
    assert_eq!(n.title, "Hi");
    assert_eq!(n.data.url, "/inbox");

    let open = engine
      .handle(EngineEvent::NotificationClick {
        action: String::new(),
        url: n.data.url.clone(),
      })
      .await;
    assert!(matches!(open, EngineAction::FocusOrOpen { url } if url == "/inbox"));

    let close = engine
      .handle(EngineEvent::NotificationClick {
        action: "close".into(),
        url: n.data.url,
      })
      .await;
    assert!(matches!(close, EngineAction::None));
  }
}
