//! User-facing notifications for push events.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::io::Write;
use tracing::info;

use crate::config::NotificationConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  pub date_of_arrival: DateTime<Utc>,
  pub primary_key: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

impl Notification {
  /// Build the notification for a push payload. An absent or blank payload
  /// gets the configured default body.
  pub fn for_push(
    title: &str,
    payload: Option<&[u8]>,
    config: &NotificationConfig,
    now: DateTime<Utc>,
  ) -> Self {
    let body = payload
      .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
      .filter(|text| !text.is_empty())
      .unwrap_or_else(|| config.default_body.clone());

    Self {
      title: title.to_string(),
      body,
      icon: config.icon.clone(),
      badge: config.badge.clone(),
      vibrate: config.vibrate.clone(),
      data: NotificationData {
        date_of_arrival: now,
        primary_key: 1,
      },
      actions: config
        .actions
        .iter()
        .map(|a| NotificationAction {
          action: a.action.clone(),
          title: a.title.clone(),
          icon: a.icon.clone(),
        })
        .collect(),
    }
  }
}

/// Displays notifications to the user.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;
}

/// Writes each notification to stdout as one JSON line.
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    info!(title = %notification.title, body = %notification.body, "showing notification");

    let line = serde_json::to_string(notification)
      .map_err(|e| eyre!("Failed to serialize notification: {}", e))?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line).map_err(|e| eyre!("Failed to write notification: {}", e))?;
    Ok(())
  }
}
