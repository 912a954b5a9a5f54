use crate::cache::Served;
use crate::classifier::Verdict;
use crate::lifecycle::{ActivationReport, InstallReport};
use crate::net::Request;
use crate::notify::Notification;
use crate::queue::FlushReport;

/// Events delivered to the worker by the host
#[derive(Debug)]
pub enum Event {
  /// New version registered; pre-populate the static generation
  Install,
  /// Version takes over; collect stale generations and claim clients
  Activate,
  /// Client issued a request
  Fetch(Request),
  /// Connectivity is back
  Sync { tag: String },
  /// Push message with optional text
  Push { payload: Option<Vec<u8>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Sync,
  Push,
}

impl EventKind {
  pub const ALL: [EventKind; 5] = [
    EventKind::Install,
    EventKind::Activate,
    EventKind::Fetch,
    EventKind::Sync,
    EventKind::Push,
  ];
}

impl Event {
  pub fn kind(&self) -> EventKind {
    match self {
      Event::Install => EventKind::Install,
      Event::Activate => EventKind::Activate,
      Event::Fetch(_) => EventKind::Fetch,
      Event::Sync { .. } => EventKind::Sync,
      Event::Push { .. } => EventKind::Push,
    }
  }
}

/// What the worker decided to do with a fetch
#[derive(Debug)]
pub enum FetchDecision {
  /// Not intercepted; the host sends it to the network untouched
  PassThrough(Verdict),
  Respond(Served),
}

/// Result of a fully handled event
#[derive(Debug)]
pub enum EventOutcome {
  Installed(InstallReport),
  Activated(ActivationReport),
  Fetch(FetchDecision),
  Synced(FlushReport),
  /// Sync trigger with a tag this worker does not own
  SyncIgnored { tag: String },
  Notified(Notification),
}
