//! Durable queue of write operations that failed for lack of connectivity.
//!
//! Entries are flushed when the host signals that the network is back. Each
//! entry is retried on its own: a stuck submission never blocks the others.
//! The queue is bounded (drop-oldest) and backs off per entry; an entry that
//! keeps failing is dropped after `max_attempts`.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::QueueConfig;
use crate::db::Database;
use crate::net::{Network, Request};

pub type SubmissionId = i64;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmission {
  pub id: SubmissionId,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub next_attempt_at: DateTime<Utc>,
  pub last_error: Option<String>,
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
  pub delivered: Vec<SubmissionId>,
  /// Failed this time, kept for a later flush
  pub retained: Vec<SubmissionId>,
  /// Failed for the last allowed time and removed
  pub dropped: Vec<SubmissionId>,
  /// Still backing off, not attempted
  pub deferred: usize,
}

pub struct SubmissionQueue {
  db: Arc<Database>,
  policy: QueueConfig,
  /// Held for a whole flush pass so two passes never send the same entry
  flushing: Mutex<()>,
}

impl SubmissionQueue {
  pub fn new(db: Arc<Database>, policy: QueueConfig) -> Self {
    Self {
      db,
      policy,
      flushing: Mutex::new(()),
    }
  }

  /// Append a payload. If the queue is over capacity, the oldest entries are dropped.
  pub fn enqueue(&self, payload: &serde_json::Value) -> Result<SubmissionId> {
    self.enqueue_at(payload, Utc::now())
  }

  fn enqueue_at(&self, payload: &serde_json::Value, now: DateTime<Utc>) -> Result<SubmissionId> {
    let data =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT INTO pending_submissions (payload, enqueued_at, next_attempt_at) VALUES (?, ?, ?)",
      params![data, now.timestamp_millis(), now.timestamp_millis()],
    )
    .map_err(|e| eyre!("Failed to enqueue submission: {}", e))?;
    let id = tx.last_insert_rowid();

    let evicted = tx
      .execute(
        "DELETE FROM pending_submissions WHERE id NOT IN
           (SELECT id FROM pending_submissions ORDER BY id DESC LIMIT ?)",
        params![self.policy.max_entries as i64],
      )
      .map_err(|e| eyre!("Failed to trim submission queue: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    if evicted > 0 {
      warn!(evicted, max = self.policy.max_entries, "submission queue full, dropped oldest");
    }
    debug!(id, "submission queued");
    Ok(id)
  }

  /// All pending submissions, oldest first.
  pub fn pending(&self) -> Result<Vec<PendingSubmission>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, payload, enqueued_at, attempts, next_attempt_at, last_error
         FROM pending_submissions ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, u32>(3)?,
          row.get::<_, i64>(4)?,
          row.get::<_, Option<String>>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query submissions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read submission: {}", e))?;

    rows
      .into_iter()
      .map(
        |(id, payload, enqueued_at, attempts, next_attempt_at, last_error)| {
          Ok(PendingSubmission {
            id,
            payload: serde_json::from_str(&payload)
              .map_err(|e| eyre!("Corrupt payload for submission {}: {}", id, e))?,
            enqueued_at: from_millis(enqueued_at)?,
            attempts,
            next_attempt_at: from_millis(next_attempt_at)?,
            last_error,
          })
        },
      )
      .collect()
  }

  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .lock()?
      .query_row("SELECT COUNT(*) FROM pending_submissions", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count submissions: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn remove(&self, id: SubmissionId) -> Result<bool> {
    let removed = self
      .db
      .lock()?
      .execute("DELETE FROM pending_submissions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove submission {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Delay before the next attempt after `attempts` failures.
  fn backoff(&self, attempts: u32) -> Duration {
    let base = self.policy.base_backoff_secs;
    let factor = 1u64.checked_shl(attempts.saturating_sub(1)).unwrap_or(u64::MAX);
    let secs = base
      .saturating_mul(factor)
      .min(self.policy.max_backoff_secs);
    Duration::seconds(secs as i64)
  }

  /// Record a failed attempt. Returns true if the entry was dropped for good.
  fn record_failure(
    &self,
    entry: &PendingSubmission,
    error: &str,
    now: DateTime<Utc>,
  ) -> Result<bool> {
    let attempts = entry.attempts + 1;

    if attempts >= self.policy.max_attempts {
      warn!(
        id = entry.id,
        attempts,
        enqueued_at = %entry.enqueued_at,
        error,
        "giving up on submission"
      );
      self.remove(entry.id)?;
      return Ok(true);
    }

    let next = now + self.backoff(attempts);
    self
      .db
      .lock()?
      .execute(
        "UPDATE pending_submissions SET attempts = ?, next_attempt_at = ?, last_error = ? WHERE id = ?",
        params![attempts, next.timestamp_millis(), error, entry.id],
      )
      .map_err(|e| eyre!("Failed to update submission {}: {}", entry.id, e))?;

    Ok(false)
  }

  /// Try every due submission once against `endpoint`.
  pub async fn flush<N: Network>(&self, network: &N, endpoint: &Url) -> Result<FlushReport> {
    self.flush_at(network, endpoint, Utc::now()).await
  }

  async fn flush_at<N: Network>(
    &self,
    network: &N,
    endpoint: &Url,
    now: DateTime<Utc>,
  ) -> Result<FlushReport> {
    let _flushing = self.flushing.lock().await;
    let mut report = FlushReport::default();

    for entry in self.pending()? {
      if entry.next_attempt_at > now {
        report.deferred += 1;
        continue;
      }
      if let Some(previous) = &entry.last_error {
        debug!(id = entry.id, attempts = entry.attempts, previous = %previous, "retrying submission");
      }

      let outcome = match Request::post_json(endpoint.clone(), &entry.payload) {
        Ok(request) => match network.fetch(&request).await {
          Ok(response) if response.status < 400 => Ok(()),
          Ok(response) => Err(format!("server answered {}", response.status)),
          Err(e) => Err(format!("{:#}", e)),
        },
        Err(e) => Err(format!("{:#}", e)),
      };

      match outcome {
        Ok(()) => {
          self.remove(entry.id)?;
          report.delivered.push(entry.id);
        }
        Err(error) => {
          warn!(id = entry.id, error = %error, "failed to submit offline form");
          if self.record_failure(&entry, &error, now)? {
            report.dropped.push(entry.id);
          } else {
            report.retained.push(entry.id);
          }
        }
      }
    }

    info!(
      delivered = report.delivered.len(),
      retained = report.retained.len(),
      dropped = report.dropped.len(),
      deferred = report.deferred,
      "submission queue flushed"
    );
    Ok(report)
  }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| eyre!("Invalid timestamp {}", ms))
}
