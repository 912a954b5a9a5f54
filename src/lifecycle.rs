//! Install/activate lifecycle: static pre-population, stale generation
//! cleanup and takeover of open clients.

use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use futures::future::try_join_all;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, Generation, RequestKey};
use crate::config::Config;
use crate::db::Database;
use crate::diagnostics::Diagnostics;
use crate::net::{Network, Request, RequestMode, Response};

/// Lifecycle state of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Installed,
  Activating,
  Active,
  /// A newer version took over
  Superseded,
  /// Install failed; this version never runs
  Redundant,
}

impl LifecycleState {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Superseded => "superseded",
      Self::Redundant => "redundant",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "installing" => Some(Self::Installing),
      "installed" => Some(Self::Installed),
      "activating" => Some(Self::Activating),
      "active" => Some(Self::Active),
      "superseded" => Some(Self::Superseded),
      "redundant" => Some(Self::Redundant),
      _ => None,
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Ordered, de-duplicated set of root-relative paths fetched at install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticManifest {
  paths: Vec<String>,
}

impl StaticManifest {
  pub fn new<I, P>(paths: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<String>,
  {
    let mut seen = BTreeSet::new();
    let paths = paths
      .into_iter()
      .map(Into::into)
      .filter(|p: &String| seen.insert(p.clone()))
      .collect();
    Self { paths }
  }

  pub fn resolve(&self, config: &Config) -> Result<Vec<Url>> {
    self.paths.iter().map(|p| config.resolve(p)).collect()
  }
}

/// Persisted lifecycle state per version, plus which version controls clients.
pub struct Registrations {
  db: Arc<Database>,
}

impl Registrations {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn set_state(&self, version: u32, state: LifecycleState) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "INSERT INTO registrations (version, state, updated_at) VALUES (?, ?, datetime('now'))
         ON CONFLICT(version) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
        params![version, state.as_str()],
      )
      .map_err(|e| eyre!("Failed to record state of v{}: {}", version, e))?;
    Ok(())
  }

  pub fn state(&self, version: u32) -> Result<Option<LifecycleState>> {
    let state: Option<String> = self
      .db
      .lock()?
      .query_row(
        "SELECT state FROM registrations WHERE version = ?",
        params![version],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read state of v{}: {}", version, e))?;

    Ok(state.as_deref().and_then(LifecycleState::parse))
  }

  /// All known versions, oldest first.
  pub fn all(&self) -> Result<Vec<(u32, LifecycleState)>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT version, state FROM registrations ORDER BY version")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)))
      .map_err(|e| eyre!("Failed to list registrations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read registration: {}", e))?;

    Ok(
      rows
        .into_iter()
        .filter_map(|(v, s)| LifecycleState::parse(&s).map(|s| (v, s)))
        .collect(),
    )
  }

  /// Mark every other active version as superseded.
  pub fn supersede_others(&self, version: u32) -> Result<Vec<u32>> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let superseded = {
      let mut stmt = tx
        .prepare("SELECT version FROM registrations WHERE state = 'active' AND version != ?")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let versions = stmt
        .query_map(params![version], |row| row.get::<_, u32>(0))
        .map_err(|e| eyre!("Failed to list active versions: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read version: {}", e))?;
      versions
    };

    tx.execute(
      "UPDATE registrations SET state = 'superseded', updated_at = datetime('now')
       WHERE state = 'active' AND version != ?",
      params![version],
    )
    .map_err(|e| eyre!("Failed to supersede old versions: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(superseded)
  }

  /// Take control of open clients without waiting for a reload.
  pub fn claim(&self, version: u32) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('controller', ?)",
        params![version.to_string()],
      )
      .map_err(|e| eyre!("Failed to claim clients for v{}: {}", version, e))?;
    Ok(())
  }

  pub fn controller(&self) -> Result<Option<u32>> {
    let value: Option<String> = self
      .db
      .lock()?
      .query_row("SELECT value FROM meta WHERE key = 'controller'", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read controller: {}", e))?;

    Ok(value.and_then(|v| v.parse().ok()))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub generation: String,
  pub entries: usize,
  /// Activate immediately instead of waiting for old clients to close
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub kept: Vec<String>,
  pub deleted: Vec<String>,
  /// Stale generations whose deletion failed; retried at next activation
  pub failed: Vec<String>,
  pub superseded: Vec<u32>,
}

pub struct Lifecycle<S: CacheStorage> {
  storage: Arc<S>,
  registrations: Registrations,
  diagnostics: Arc<Diagnostics>,
  version: u32,
  static_generation: Generation,
  dynamic_generation: Generation,
  manifest: Vec<Url>,
  vary_headers: BTreeSet<String>,
}

impl<S: CacheStorage> Lifecycle<S> {
  pub fn new(
    config: &Config,
    storage: Arc<S>,
    registrations: Registrations,
    diagnostics: Arc<Diagnostics>,
  ) -> Result<Self> {
    let manifest = StaticManifest::new(config.static_assets.iter().cloned()).resolve(config)?;

    Ok(Self {
      storage,
      registrations,
      diagnostics,
      version: config.version,
      static_generation: config.static_generation(),
      dynamic_generation: config.dynamic_generation(),
      manifest,
      vary_headers: config.vary_headers.clone(),
    })
  }

  pub fn registrations(&self) -> &Registrations {
    &self.registrations
  }

  /// Pre-populate the static generation. All or nothing: if any manifest
  /// entry cannot be fetched or stored, nothing is written and this version
  /// becomes redundant.
  ///
  /// Re-installing the version that already controls clients refreshes its
  /// static generation but never changes its recorded state.
  pub async fn install<N: Network>(&self, network: &N) -> Result<InstallReport> {
    info!(version = self.version, "installing");
    let live = self.registrations.state(self.version)? == Some(LifecycleState::Active);
    if !live {
      self
        .registrations
        .set_state(self.version, LifecycleState::Installing)?;
    }

    match self.populate_static(network).await {
      Ok(entries) => {
        if !live {
          self
            .registrations
            .set_state(self.version, LifecycleState::Installed)?;
        }
        info!(generation = %self.static_generation, entries, "static assets cached");
        Ok(InstallReport {
          generation: self.static_generation.name(),
          entries,
          skip_waiting: true,
        })
      }
      Err(e) => {
        error!(version = self.version, error = %format!("{:#}", e), "install failed");
        if live {
          return Err(e);
        }
        if let Err(state_err) = self
          .registrations
          .set_state(self.version, LifecycleState::Redundant)
        {
          self.diagnostics.record("install", &state_err);
        }
        Err(e)
      }
    }
  }

  async fn populate_static<N: Network>(&self, network: &N) -> Result<usize> {
    let mut fetches = Vec::with_capacity(self.manifest.len());
    for url in &self.manifest {
      fetches.push(self.fetch_static(network, url));
    }

    let entries = try_join_all(fetches).await?;
    self
      .storage
      .put_all(&self.static_generation.name(), &entries)
      .wrap_err_with(|| format!("Failed to store {}", self.static_generation))?;

    Ok(entries.len())
  }

  async fn fetch_static<N: Network>(&self, network: &N, url: &Url) -> Result<(RequestKey, Response)> {
    let request = Request::get(url.clone()).with_mode(RequestMode::SameOrigin);
    let response = network
      .fetch(&request)
      .await
      .wrap_err_with(|| format!("Failed to fetch static asset {}", url))?;

    if !response.is_ok() {
      return Err(eyre!(
        "Static asset {} returned status {}",
        url,
        response.status
      ));
    }

    Ok((RequestKey::from_request(&request, &self.vary_headers), response))
  }

  /// Delete every generation that is not the current static/dynamic pair,
  /// then take over open clients. A failed deletion is recorded and skipped.
  ///
  /// Only an installed version (or one already active or mid-activation) may
  /// activate; anything else would leave clients without a static set.
  pub fn activate(&self) -> Result<ActivationReport> {
    match self.registrations.state(self.version)? {
      Some(LifecycleState::Installed | LifecycleState::Activating | LifecycleState::Active) => {}
      state => {
        return Err(eyre!(
          "v{} cannot activate from state {}",
          self.version,
          state.map_or("unregistered", LifecycleState::as_str)
        ))
      }
    }

    info!(version = self.version, "activating");
    self
      .registrations
      .set_state(self.version, LifecycleState::Activating)?;

    let current = [self.static_generation.name(), self.dynamic_generation.name()];
    let mut report = ActivationReport::default();

    for name in self.storage.generations()? {
      if current.contains(&name) {
        report.kept.push(name);
        continue;
      }

      match self.storage.delete_generation(&name) {
        Ok(_) => {
          info!(generation = %name, "deleted stale generation");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(generation = %name, "failed to delete stale generation");
          self.diagnostics.record("generation cleanup", &e);
          report.failed.push(name);
        }
      }
    }

    report.superseded = self.registrations.supersede_others(self.version)?;
    self
      .registrations
      .set_state(self.version, LifecycleState::Active)?;
    self.registrations.claim(self.version)?;

    Ok(report)
  }
}
