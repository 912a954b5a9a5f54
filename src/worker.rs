//! The worker service: owns the cache, the queue and the lifecycle, and
//! routes host events through an explicit dispatch table.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage};
use crate::classifier::classify;
use crate::config::Config;
use crate::db::Database;
use crate::diagnostics::{BackgroundTasks, Diagnostic, Diagnostics};
use crate::event::{Event, EventKind, EventOutcome, FetchDecision};
use crate::lifecycle::{Lifecycle, LifecycleState, Registrations};
use crate::net::{Network, Request};
use crate::notify::{Notification, Notifier};
use crate::queue::{SubmissionId, SubmissionQueue};

/// Event handler. The returned future is what the host awaits before it
/// considers the event handled.
type Handler<S, N> = for<'a> fn(&'a Worker<S, N>, Event) -> BoxFuture<'a, Result<EventOutcome>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
  /// Not a production build
  Skipped,
  /// The current version already controls clients
  AlreadyActive,
  /// Installed and activated this run
  Activated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// The endpoint answered (with any status)
  Delivered(u16),
  /// No connectivity; stored for the next sync
  Queued(SubmissionId),
}

#[derive(Debug, Clone)]
pub struct Status {
  pub static_generation: String,
  pub dynamic_generation: String,
  /// Every stored generation with its entry count
  pub generations: Vec<(String, usize)>,
  pub pending_submissions: usize,
  /// Detached cache writes still running
  pub background_tasks: usize,
  pub registrations: Vec<(u32, LifecycleState)>,
  pub controller: Option<u32>,
}

pub struct Worker<S: CacheStorage, N: Network> {
  config: Config,
  storage: Arc<S>,
  network: Arc<N>,
  cache: CacheLayer<S, N>,
  lifecycle: Lifecycle<S>,
  queue: SubmissionQueue,
  notifier: Arc<dyn Notifier>,
  submit_endpoint: Url,
  tasks: Arc<BackgroundTasks>,
  diagnostics: Arc<Diagnostics>,
  handlers: HashMap<EventKind, Handler<S, N>>,
}

impl<S: CacheStorage, N: Network> Worker<S, N> {
  pub fn new(
    config: Config,
    db: Arc<Database>,
    storage: S,
    network: N,
    notifier: Arc<dyn Notifier>,
  ) -> Result<Self> {
    let storage = Arc::new(storage);
    let network = Arc::new(network);
    let diagnostics = Arc::new(Diagnostics::new());
    let tasks = Arc::new(BackgroundTasks::new(Arc::clone(&diagnostics)));

    let fallback = Request::get(config.resolve(&config.offline_fallback)?);
    let cache = CacheLayer::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      config.dynamic_generation().name(),
      fallback,
      config.vary_headers.clone(),
      Arc::clone(&tasks),
      Arc::clone(&diagnostics),
    );
    let lifecycle = Lifecycle::new(
      &config,
      Arc::clone(&storage),
      Registrations::new(Arc::clone(&db)),
      Arc::clone(&diagnostics),
    )?;
    let queue = SubmissionQueue::new(db, config.queue.clone());
    let submit_endpoint = config.resolve(&config.submit_endpoint)?;

    Ok(Self {
      config,
      storage,
      network,
      cache,
      lifecycle,
      queue,
      notifier,
      submit_endpoint,
      tasks,
      diagnostics,
      handlers: dispatch_table(),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  pub fn queue(&self) -> &SubmissionQueue {
    &self.queue
  }

  pub fn diagnostics(&self) -> Vec<Diagnostic> {
    self.diagnostics.recent()
  }

  /// Route an event to its handler and wait for it.
  pub async fn handle(&self, event: Event) -> Result<EventOutcome> {
    let kind = event.kind();
    let handler = self
      .handlers
      .get(&kind)
      .ok_or_else(|| eyre!("No handler registered for {:?}", kind))?;
    debug!(?kind, "dispatching event");
    handler(self, event).await
  }

  /// Wait for detached work (background cache writes) to finish.
  pub async fn settle(&self) {
    self.tasks.settle().await;
  }

  /// Install and activate the current version unless it already controls
  /// clients. Only production builds register.
  pub async fn register(&self) -> Result<Registration> {
    if !self.config.production {
      info!("not a production build, skipping registration");
      return Ok(Registration::Skipped);
    }

    if self.lifecycle.registrations().controller()? == Some(self.config.version) {
      return Ok(Registration::AlreadyActive);
    }

    if let EventOutcome::Installed(report) = self.handle(Event::Install).await? {
      if report.skip_waiting {
        self.handle(Event::Activate).await?;
      }
    }
    Ok(Registration::Activated)
  }

  /// Send a form submission; if the network is unreachable, queue it.
  pub async fn submit(&self, payload: serde_json::Value) -> Result<SubmitOutcome> {
    let request = Request::post_json(self.submit_endpoint.clone(), &payload)?;

    match self.network.fetch(&request).await {
      Ok(response) => Ok(SubmitOutcome::Delivered(response.status)),
      Err(e) => {
        info!(error = %format!("{:#}", e), "offline, deferring submission");
        let id = self.queue.enqueue(&payload)?;
        Ok(SubmitOutcome::Queued(id))
      }
    }
  }

  pub fn status(&self) -> Result<Status> {
    let generations = self
      .storage
      .generations()?
      .into_iter()
      .map(|name| {
        let count = self.storage.entry_count(&name)?;
        Ok((name, count))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Status {
      static_generation: self.config.static_generation().name(),
      dynamic_generation: self.config.dynamic_generation().name(),
      generations,
      pending_submissions: self.queue.len()?,
      background_tasks: self.tasks.pending(),
      registrations: self.lifecycle.registrations().all()?,
      controller: self.lifecycle.registrations().controller()?,
    })
  }
}

fn dispatch_table<S: CacheStorage, N: Network>() -> HashMap<EventKind, Handler<S, N>> {
  let mut table: HashMap<EventKind, Handler<S, N>> = HashMap::new();
  table.insert(EventKind::Install, on_install::<S, N>);
  table.insert(EventKind::Activate, on_activate::<S, N>);
  table.insert(EventKind::Fetch, on_fetch::<S, N>);
  table.insert(EventKind::Sync, on_sync::<S, N>);
  table.insert(EventKind::Push, on_push::<S, N>);
  table
}

fn unexpected(expected: EventKind, event: &Event) -> color_eyre::Report {
  eyre!("{:?} handler received {:?} event", expected, event.kind())
}

fn on_install<S: CacheStorage, N: Network>(
  worker: &Worker<S, N>,
  _event: Event,
) -> BoxFuture<'_, Result<EventOutcome>> {
  Box::pin(async move {
    let report = worker.lifecycle.install(worker.network.as_ref()).await?;
    Ok(EventOutcome::Installed(report))
  })
}

fn on_activate<S: CacheStorage, N: Network>(
  worker: &Worker<S, N>,
  _event: Event,
) -> BoxFuture<'_, Result<EventOutcome>> {
  Box::pin(async move {
    let report = worker.lifecycle.activate()?;
    Ok(EventOutcome::Activated(report))
  })
}

fn on_fetch<S: CacheStorage, N: Network>(
  worker: &Worker<S, N>,
  event: Event,
) -> BoxFuture<'_, Result<EventOutcome>> {
  Box::pin(async move {
    let request = match event {
      Event::Fetch(request) => request,
      other => return Err(unexpected(EventKind::Fetch, &other)),
    };

    let verdict = classify(&request.method, &request.url);
    if !verdict.is_intercepted() {
      debug!(method = %request.method, url = %request.url, ?verdict, "passing through");
      return Ok(EventOutcome::Fetch(FetchDecision::PassThrough(verdict)));
    }

    let served = worker.cache.respond(&request).await?;
    Ok(EventOutcome::Fetch(FetchDecision::Respond(served)))
  })
}

fn on_sync<S: CacheStorage, N: Network>(
  worker: &Worker<S, N>,
  event: Event,
) -> BoxFuture<'_, Result<EventOutcome>> {
  Box::pin(async move {
    let tag = match event {
      Event::Sync { tag } => tag,
      other => return Err(unexpected(EventKind::Sync, &other)),
    };

    if tag != worker.config.sync_tag {
      debug!(%tag, "ignoring sync for another tag");
      return Ok(EventOutcome::SyncIgnored { tag });
    }

    let report = worker
      .queue
      .flush(worker.network.as_ref(), &worker.submit_endpoint)
      .await?;
    Ok(EventOutcome::Synced(report))
  })
}

fn on_push<S: CacheStorage, N: Network>(
  worker: &Worker<S, N>,
  event: Event,
) -> BoxFuture<'_, Result<EventOutcome>> {
  Box::pin(async move {
    let payload = match event {
      Event::Push { payload } => payload,
      other => return Err(unexpected(EventKind::Push, &other)),
    };

    let notification = Notification::for_push(
      worker.config.notification_title(),
      payload.as_deref(),
      &worker.config.notification,
      Utc::now(),
    );
    worker.notifier.show(&notification)?;
    Ok(EventOutcome::Notified(notification))
  })
}
