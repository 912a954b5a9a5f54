//! Sink for failures that are deliberately not surfaced to callers.

use chrono::{DateTime, Utc};
use color_eyre::Report;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct Diagnostic {
  pub at: DateTime<Utc>,
  pub context: String,
  pub message: String,
}

/// Bounded ring of recent swallowed errors. Every record is also logged.
pub struct Diagnostics {
  recent: Mutex<VecDeque<Diagnostic>>,
  capacity: usize,
}

impl Diagnostics {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_CAPACITY)
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      recent: Mutex::new(VecDeque::with_capacity(capacity)),
      capacity,
    }
  }

  pub fn record(&self, context: &str, error: &Report) {
    let message = format!("{:#}", error);
    warn!(context, error = %message, "swallowed failure");

    let Ok(mut recent) = self.recent.lock() else {
      return;
    };
    if recent.len() == self.capacity {
      recent.pop_front();
    }
    recent.push_back(Diagnostic {
      at: Utc::now(),
      context: context.to_string(),
      message,
    });
  }

  pub fn recent(&self) -> Vec<Diagnostic> {
    self
      .recent
      .lock()
      .map(|r| r.iter().cloned().collect())
      .unwrap_or_default()
  }
}

impl Default for Diagnostics {
  fn default() -> Self {
    Self::new()
  }
}

/// Detached work the host must let finish before tearing the worker down.
///
/// Finished tasks are reaped whenever a new one is spawned, so the set only
/// holds work that is still running.
pub struct BackgroundTasks {
  tasks: Mutex<JoinSet<()>>,
  diagnostics: Arc<Diagnostics>,
}

impl BackgroundTasks {
  pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
    Self {
      tasks: Mutex::new(JoinSet::new()),
      diagnostics,
    }
  }

  /// Spawn a task nobody awaits. Its outcome is its own business.
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    match self.tasks.lock() {
      Ok(mut tasks) => {
        while let Some(result) = tasks.try_join_next() {
          self.report(result);
        }
        tasks.spawn(task);
      }
      Err(_) => {
        tokio::spawn(task);
      }
    }
  }

  /// Wait for every task spawned so far. Panicked tasks are reported to diagnostics.
  pub async fn settle(&self) {
    loop {
      let mut tasks = match self.tasks.lock() {
        Ok(mut tasks) => std::mem::take(&mut *tasks),
        Err(_) => return,
      };
      if tasks.is_empty() {
        return;
      }

      debug!(pending = tasks.len(), "settling background tasks");
      while let Some(result) = tasks.join_next().await {
        self.report(result);
      }
    }
  }

  /// Tasks spawned and not yet reaped.
  pub fn pending(&self) -> usize {
    self.tasks.lock().map(|t| t.len()).unwrap_or(0)
  }

  fn report(&self, result: Result<(), JoinError>) {
    if let Err(e) = result {
      self.diagnostics.record("background task", &Report::new(e));
    }
  }
}
