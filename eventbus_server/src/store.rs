//! Sqlite-backed event store.
//!
//! `event_id` is the primary key, so a replayed delivery hits the
//! `INSERT OR IGNORE` and reports a duplicate instead of a second row. The
//! database runs in WAL journal mode with NORMAL synchronous writes: appends
//! hit the journal immediately and fsync happens on checkpoint, which is the
//! durability class the ack contract promises.

use crate::error::BusError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SCHEMA: &[&str] = &[
  "CREATE TABLE IF NOT EXISTS events (
     event_id     TEXT PRIMARY KEY,
     agent_id     TEXT NOT NULL,
     kind         TEXT NOT NULL,
     timestamp_ns INTEGER NOT NULL,
     received_ns  INTEGER NOT NULL,
     skew_flagged INTEGER NOT NULL DEFAULT 0,
     envelope     BLOB NOT NULL
   )",
  "CREATE INDEX IF NOT EXISTS idx_events_agent_ts ON events(agent_id, timestamp_ns)",
];

/// A stored event as handed to read-side consumers.
#[derive(Debug, Clone)]
pub struct StoredEvent {
  pub rowid: i64,
  pub event_id: String,
  pub agent_id: String,
  pub kind: String,
  pub timestamp_ns: i64,
  pub skew_flagged: bool,
  pub envelope: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct EventStore {
  pool: SqlitePool,
}

impl EventStore {
  pub async fn open(path: &Path) -> Result<Self, BusError> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .synchronous(SqliteSynchronous::Normal)
      .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
      .max_connections(8)
      .connect_with(options)
      .await?;

    for statement in SCHEMA {
      sqlx::query(statement).execute(&pool).await?;
    }

    info!(path = %path.display(), "Event store opened");
    Ok(Self { pool })
  }

  /// Append one event. Returns `false` when a row with the same `event_id`
  /// already exists (replayed delivery).
  pub async fn insert(
    &self,
    event_id: &str,
    agent_id: &str,
    kind: &str,
    timestamp_ns: i64,
    received_ns: i64,
    skew_flagged: bool,
    envelope: &[u8],
  ) -> Result<bool, BusError> {
    let result = sqlx::query(
      "INSERT OR IGNORE INTO events
         (event_id, agent_id, kind, timestamp_ns, received_ns, skew_flagged, envelope)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event_id)
    .bind(agent_id)
    .bind(kind)
    .bind(timestamp_ns)
    .bind(received_ns)
    .bind(skew_flagged as i64)
    .bind(envelope)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  pub async fn contains(&self, event_id: &str) -> Result<bool, BusError> {
    let row = sqlx::query("SELECT 1 FROM events WHERE event_id = ?")
      .bind(event_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.is_some())
  }

  /// Read-side API: events appended after `rowid`, in append order.
  pub async fn events_after(&self, rowid: i64, limit: i64) -> Result<Vec<StoredEvent>, BusError> {
    let rows = sqlx::query(
      "SELECT rowid, event_id, agent_id, kind, timestamp_ns, skew_flagged, envelope
       FROM events WHERE rowid > ? ORDER BY rowid LIMIT ?",
    )
    .bind(rowid)
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(Self::decode_row).collect())
  }

  /// Read-side API: events captured at or after `since_ns`, in append order.
  /// Used by the fusion engine to rebuild its window after a restart.
  pub async fn events_since(&self, since_ns: i64) -> Result<Vec<StoredEvent>, BusError> {
    let rows = sqlx::query(
      "SELECT rowid, event_id, agent_id, kind, timestamp_ns, skew_flagged, envelope
       FROM events WHERE timestamp_ns >= ? ORDER BY rowid",
    )
    .bind(since_ns)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(Self::decode_row).collect())
  }

  /// Drop events captured before `cutoff_ns`. Returns the number pruned.
  pub async fn prune_older_than(&self, cutoff_ns: i64) -> Result<u64, BusError> {
    let result = sqlx::query("DELETE FROM events WHERE timestamp_ns < ?")
      .bind(cutoff_ns)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected())
  }

  pub async fn count(&self) -> Result<i64, BusError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
      .fetch_one(&self.pool)
      .await?;
    Ok(row.get::<i64, _>("n"))
  }

  /// Readiness probe: the store answers a trivial query.
  pub async fn healthy(&self) -> bool {
    sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
  }

  fn decode_row(row: sqlx::sqlite::SqliteRow) -> StoredEvent {
    StoredEvent {
      rowid: row.get("rowid"),
      event_id: row.get("event_id"),
      agent_id: row.get("agent_id"),
      kind: row.get("kind"),
      timestamp_ns: row.get("timestamp_ns"),
      skew_flagged: row.get::<i64, _>("skew_flagged") != 0,
      envelope: row.get("envelope"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn open_temp() -> (EventStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(&dir.path().join("events.db")).await.unwrap();
    (store, dir)
  }

  #[tokio::test]
  async fn insert_is_idempotent_per_event_id() {
    let (store, _dir) = open_temp().await;

    let inserted = store
      .insert("evt-1", "agent-1", "security", 100, 200, false, b"payload")
      .await
      .unwrap();
    assert!(inserted);

    let inserted = store
      .insert("evt-1", "agent-1", "security", 100, 200, false, b"payload")
      .await
      .unwrap();
    assert!(!inserted);

    assert_eq!(store.count().await.unwrap(), 1);
    assert!(store.contains("evt-1").await.unwrap());
    assert!(!store.contains("evt-2").await.unwrap());
  }

  #[tokio::test]
  async fn events_after_pages_in_append_order() {
    let (store, _dir) = open_temp().await;

    for i in 0..5 {
      store
        .insert(&format!("evt-{}", i), "agent-1", "flow", i, i, false, b"x")
        .await
        .unwrap();
    }

    let first = store.events_after(0, 3).await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first[0].event_id, "evt-0");

    let rest = store.events_after(first[2].rowid, 10).await.unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[1].event_id, "evt-4");
  }

  #[tokio::test]
  async fn prune_removes_only_old_events() {
    let (store, _dir) = open_temp().await;

    store.insert("old", "a", "flow", 10, 10, false, b"x").await.unwrap();
    store.insert("new", "a", "flow", 100, 100, false, b"x").await.unwrap();

    let pruned = store.prune_older_than(50).await.unwrap();
    assert_eq!(pruned, 1);
    assert!(!store.contains("old").await.unwrap());
    assert!(store.contains("new").await.unwrap());
  }

  #[tokio::test]
  async fn events_since_rebuilds_a_window() {
    let (store, _dir) = open_temp().await;

    store.insert("e1", "a", "flow", 10, 10, false, b"x").await.unwrap();
    store.insert("e2", "a", "flow", 60, 60, false, b"x").await.unwrap();
    store.insert("e3", "b", "flow", 90, 90, true, b"x").await.unwrap();

    let window = store.events_since(50).await.unwrap();
    assert_eq!(window.len(), 2);
    assert_eq!(window[0].event_id, "e2");
    assert!(window[1].skew_flagged);
  }
}
