//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use url::Url;

use crate::db::Database;
use crate::net::{Response, ResponseType};

use super::traits::{CachedEntry, RequestKey};

/// Trait for cache storage backends.
///
/// Every write is atomic from the caller's point of view: an entry is either
/// fully stored or not at all.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the generation if it does not exist yet.
  fn open(&self, generation: &str) -> Result<()>;

  /// All generation names, in creation order.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and all its entries. Returns false if it did not exist.
  fn delete_generation(&self, generation: &str) -> Result<bool>;

  /// Store one snapshot, replacing any previous value for the same key.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store a batch in one transaction. The generation is only created if
  /// every entry is written.
  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Look up a key across all generations; the oldest generation wins.
  fn lookup(&self, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Look up a key within one generation.
  fn lookup_in(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Number of entries held by a generation.
  fn entry_count(&self, generation: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

const SELECT_ENTRY: &str = "SELECT e.url, e.status, e.headers, e.body, e.response_type, e.generation, e.cached_at
   FROM cache_entries e
   INNER JOIN generations g ON g.name = e.generation";

fn open_generation(conn: &Connection, generation: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (generation, key_hash, descriptor, url, status, headers, body, response_type, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key.cache_hash(),
        key.description(),
        response.url.as_str(),
        response.status,
        headers,
        response.body,
        response.response_type.as_str(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key.url, generation, e))?;

  Ok(())
}

type EntryRow = (String, u16, String, Vec<u8>, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}

fn into_entry(row: EntryRow) -> Result<CachedEntry> {
  let (url, status, headers, body, response_type, generation, cached_at) = row;

  let url = Url::parse(&url).map_err(|e| eyre!("Corrupt cached url '{}': {}", url, e))?;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
  let response_type = ResponseType::parse(&response_type)
    .ok_or_else(|| eyre!("Unknown response type '{}'", response_type))?;

  Ok(CachedEntry {
    response: Response {
      url,
      status,
      headers,
      body,
      response_type,
    },
    generation,
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, generation: &str) -> Result<()> {
    let conn = self.db.lock()?;
    open_generation(&conn, generation)
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;

    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![generation])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    open_generation(&tx, generation)?;
    insert_entry(&tx, generation, key, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    open_generation(&tx, generation)?;
    for (key, response) in entries {
      insert_entry(&tx, generation, key, response)?;
    }

    // Dropping the transaction without commit rolls everything back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn lookup(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.db.lock()?;

    let row = conn
      .query_row(
        &format!("{} WHERE e.key_hash = ? ORDER BY g.id LIMIT 1", SELECT_ENTRY),
        params![key.cache_hash()],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.url, e))?;

    row.map(into_entry).transpose()
  }

  fn lookup_in(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.db.lock()?;

    let row = conn
      .query_row(
        &format!("{} WHERE e.generation = ? AND e.key_hash = ?", SELECT_ENTRY),
        params![generation, key.cache_hash()],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key.url, generation, e))?;

    row.map(into_entry).transpose()
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.db.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", generation, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
