//! The agent write-ahead log.
//!
//! Every observed event is appended here before anything touches the
//! network, so a crash between capture and publish loses nothing. Records
//! move PENDING → IN_FLIGHT → ACKED_PURGEABLE; a retryable failure sends
//! IN_FLIGHT back to PENDING with a bumped attempt count, and a permanent
//! rejection lands in the dead-letter table. The database runs with
//! `synchronous=FULL` so `enqueue` only returns after the record is on disk.

use crate::config::{BackpressurePolicy, WalConfig};
use crate::error::AgentError;
use metrics::{counter, gauge};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &[&str] = &[
  "CREATE TABLE IF NOT EXISTS wal_records (
     seq             INTEGER PRIMARY KEY AUTOINCREMENT,
     event_id        TEXT NOT NULL,
     envelope        BLOB NOT NULL,
     enqueued_at_ms  INTEGER NOT NULL,
     attempts        INTEGER NOT NULL DEFAULT 0,
     next_attempt_ms INTEGER NOT NULL DEFAULT 0,
     state           TEXT NOT NULL DEFAULT 'PENDING'
   )",
  "CREATE INDEX IF NOT EXISTS idx_wal_state_seq ON wal_records(state, seq)",
  "CREATE TABLE IF NOT EXISTS dead_letters (
     seq           INTEGER PRIMARY KEY,
     event_id      TEXT NOT NULL,
     envelope      BLOB NOT NULL,
     reason        TEXT NOT NULL,
     failed_at_ms  INTEGER NOT NULL
   )",
];

#[derive(Debug, Clone)]
pub struct WalRecord {
  pub seq: i64,
  pub event_id: String,
  pub envelope: Vec<u8>,
  pub attempts: u32,
}

#[derive(Debug)]
pub struct Wal {
  pool: SqlitePool,
  config: WalConfig,
}

impl Wal {
  pub async fn open(config: WalConfig) -> Result<Self, AgentError> {
    if let Some(parent) = config.wal_path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let options = SqliteConnectOptions::new()
      .filename(&config.wal_path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .synchronous(SqliteSynchronous::Full)
      .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    for statement in SCHEMA {
      sqlx::query(statement).execute(&pool).await?;
    }

    let wal = Self { pool, config };

    // Anything left IN_FLIGHT belongs to a previous run whose ack we never
    // saw; redelivery is safe because the bus dedups by event id.
    let recovered = wal.recover_inflight().await?;
    if recovered > 0 {
      info!(recovered, "Recovered in-flight WAL records to PENDING");
    }

    wal.refresh_gauges().await?;
    Ok(wal)
  }

  /// Durably append a record in PENDING. Applies the configured
  /// backpressure policy at high water; never touches the network.
  pub async fn enqueue(&self, event_id: &str, envelope: &[u8]) -> Result<i64, AgentError> {
    loop {
      let (records, bytes) = self.depth().await?;
      let over = records >= self.config.high_water_records || bytes >= self.config.high_water_bytes;
      if !over {
        break;
      }

      match self.config.backpressure_policy {
        BackpressurePolicy::Drop => {
          counter!("wal_dropped_total").increment(1);
          warn!(event_id, "WAL at high water, dropping event per policy");
          return Err(AgentError::HighWaterDropped);
        }
        BackpressurePolicy::Block => {
          counter!("wal_backpressure_blocks_total").increment(1);
          tokio::time::sleep(Duration::from_millis(50)).await;
        }
      }
    }

    let now_ms = now_ms();
    let result = sqlx::query(
      "INSERT INTO wal_records (event_id, envelope, enqueued_at_ms) VALUES (?, ?, ?)",
    )
    .bind(event_id)
    .bind(envelope)
    .bind(now_ms)
    .execute(&self.pool)
    .await?;

    self.refresh_gauges().await?;
    Ok(result.last_insert_rowid())
  }

  /// Next deliverable record in `seq` order, moved to IN_FLIGHT. The
  /// publisher is a single task, so select-then-update does not race.
  pub async fn next_ready(&self) -> Result<Option<WalRecord>, AgentError> {
    let row = sqlx::query(
      "SELECT seq, event_id, envelope, attempts FROM wal_records
       WHERE state = 'PENDING' AND next_attempt_ms <= ?
       ORDER BY seq LIMIT 1",
    )
    .bind(now_ms())
    .fetch_optional(&self.pool)
    .await?;

    let Some(row) = row else {
      return Ok(None);
    };

    let record = WalRecord {
      seq: row.get("seq"),
      event_id: row.get("event_id"),
      envelope: row.get("envelope"),
      attempts: row.get::<i64, _>("attempts") as u32,
    };

    sqlx::query("UPDATE wal_records SET state = 'IN_FLIGHT' WHERE seq = ?")
      .bind(record.seq)
      .execute(&self.pool)
      .await?;

    Ok(Some(record))
  }

  /// Terminal OK from the bus: the record is purgeable.
  pub async fn mark_acked(&self, seq: i64) -> Result<(), AgentError> {
    sqlx::query("UPDATE wal_records SET state = 'ACKED_PURGEABLE' WHERE seq = ?")
      .bind(seq)
      .execute(&self.pool)
      .await?;

    let purgeable = self.acked_count().await?;
    if purgeable >= self.config.purge_batch_size {
      let purged = self.purge_acked().await?;
      debug!(purged, "Compacted acked WAL records");
    }

    self.refresh_gauges().await?;
    Ok(())
  }

  /// Retryable failure: back to PENDING with the next attempt scheduled.
  pub async fn reschedule(&self, seq: i64, next_attempt_ms: i64) -> Result<(), AgentError> {
    sqlx::query(
      "UPDATE wal_records
       SET state = 'PENDING', attempts = attempts + 1, next_attempt_ms = ?
       WHERE seq = ?",
    )
    .bind(next_attempt_ms)
    .bind(seq)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  /// Permanent rejection: move the record to the dead-letter table.
  pub async fn dead_letter(&self, record: &WalRecord, reason: &str) -> Result<(), AgentError> {
    sqlx::query(
      "INSERT OR IGNORE INTO dead_letters (seq, event_id, envelope, reason, failed_at_ms)
       VALUES (?, ?, ?, ?, ?)",
    )
    .bind(record.seq)
    .bind(&record.event_id)
    .bind(&record.envelope)
    .bind(reason)
    .bind(now_ms())
    .execute(&self.pool)
    .await?;

    sqlx::query("DELETE FROM wal_records WHERE seq = ?")
      .bind(record.seq)
      .execute(&self.pool)
      .await?;

    counter!("dead_letter_total", "reason" => reason.to_string()).increment(1);
    self.refresh_gauges().await?;
    Ok(())
  }

  /// Revert IN_FLIGHT records to PENDING. Used at open (crash recovery)
  /// and on graceful shutdown.
  pub async fn recover_inflight(&self) -> Result<u64, AgentError> {
    let result = sqlx::query("UPDATE wal_records SET state = 'PENDING' WHERE state = 'IN_FLIGHT'")
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected())
  }

  /// Drop all purgeable records.
  pub async fn purge_acked(&self) -> Result<u64, AgentError> {
    let result = sqlx::query("DELETE FROM wal_records WHERE state = 'ACKED_PURGEABLE'")
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected())
  }

  /// Outstanding queue depth: records and bytes not yet terminally acked.
  pub async fn depth(&self) -> Result<(u64, u64), AgentError> {
    let row = sqlx::query(
      "SELECT COUNT(*) AS records, COALESCE(SUM(LENGTH(envelope)), 0) AS bytes
       FROM wal_records WHERE state IN ('PENDING', 'IN_FLIGHT')",
    )
    .fetch_one(&self.pool)
    .await?;

    Ok((
      row.get::<i64, _>("records") as u64,
      row.get::<i64, _>("bytes") as u64,
    ))
  }

  pub async fn dead_letter_count(&self) -> Result<u64, AgentError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM dead_letters")
      .fetch_one(&self.pool)
      .await?;
    Ok(row.get::<i64, _>("n") as u64)
  }

  async fn acked_count(&self) -> Result<u64, AgentError> {
    let row =
      sqlx::query("SELECT COUNT(*) AS n FROM wal_records WHERE state = 'ACKED_PURGEABLE'")
        .fetch_one(&self.pool)
        .await?;
    Ok(row.get::<i64, _>("n") as u64)
  }

  async fn refresh_gauges(&self) -> Result<(), AgentError> {
    let (records, bytes) = self.depth().await?;
    gauge!("wal_depth").set(records as f64);
    gauge!("wal_bytes").set(bytes as f64);
    Ok(())
  }

  /// Compact and close. IN_FLIGHT records are parked back to PENDING so the
  /// next run redelivers them.
  pub async fn close(&self) -> Result<(), AgentError> {
    self.recover_inflight().await?;
    self.purge_acked().await?;
    self.pool.close().await;
    Ok(())
  }
}

fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::WalConfig;

  fn config(dir: &tempfile::TempDir) -> WalConfig {
    WalConfig {
      wal_path: dir.path().join("wal.db"),
      high_water_records: 10_000,
      high_water_bytes: 64 * 1024 * 1024,
      backpressure_policy: BackpressurePolicy::Block,
      purge_batch_size: 256,
    }
  }

  #[tokio::test]
  async fn enqueue_then_drain_in_seq_order() {
    let dir = tempfile::tempdir().unwrap();
    let wal = Wal::open(config(&dir)).await.unwrap();

    wal.enqueue("evt-a", b"aaa").await.unwrap();
    wal.enqueue("evt-b", b"bbb").await.unwrap();

    let first = wal.next_ready().await.unwrap().unwrap();
    assert_eq!(first.event_id, "evt-a");

    // evt-a is IN_FLIGHT now; the next ready record is evt-b.
    let second = wal.next_ready().await.unwrap().unwrap();
    assert_eq!(second.event_id, "evt-b");

    wal.mark_acked(first.seq).await.unwrap();
    wal.mark_acked(second.seq).await.unwrap();
    assert_eq!(wal.depth().await.unwrap().0, 0);
  }

  #[tokio::test]
  async fn rescheduled_records_wait_for_their_attempt_time() {
    let dir = tempfile::tempdir().unwrap();
    let wal = Wal::open(config(&dir)).await.unwrap();

    wal.enqueue("evt-a", b"aaa").await.unwrap();
    let record = wal.next_ready().await.unwrap().unwrap();

    wal
      .reschedule(record.seq, now_ms() + 60_000)
      .await
      .unwrap();
    assert!(wal.next_ready().await.unwrap().is_none());

    wal.reschedule(record.seq, 0).await.unwrap();
    let retried = wal.next_ready().await.unwrap().unwrap();
    assert_eq!(retried.event_id, "evt-a");
    assert_eq!(retried.attempts, 2);
  }

  #[tokio::test]
  async fn reopen_recovers_inflight_records() {
    let dir = tempfile::tempdir().unwrap();

    {
      let wal = Wal::open(config(&dir)).await.unwrap();
      wal.enqueue("evt-a", b"aaa").await.unwrap();
      let _inflight = wal.next_ready().await.unwrap().unwrap();
      // Simulated crash: no ack, no park.
    }

    let wal = Wal::open(config(&dir)).await.unwrap();
    let recovered = wal.next_ready().await.unwrap().unwrap();
    assert_eq!(recovered.event_id, "evt-a");
  }

  #[tokio::test]
  async fn dead_letter_removes_the_record_from_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let wal = Wal::open(config(&dir)).await.unwrap();

    wal.enqueue("evt-bad", b"bad").await.unwrap();
    let record = wal.next_ready().await.unwrap().unwrap();
    wal.dead_letter(&record, "invalid").await.unwrap();

    assert!(wal.next_ready().await.unwrap().is_none());
    assert_eq!(wal.depth().await.unwrap().0, 0);
    assert_eq!(wal.dead_letter_count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn drop_policy_rejects_at_high_water() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    cfg.high_water_records = 2;
    cfg.backpressure_policy = BackpressurePolicy::Drop;
    let wal = Wal::open(cfg).await.unwrap();

    wal.enqueue("evt-1", b"x").await.unwrap();
    wal.enqueue("evt-2", b"x").await.unwrap();

    let result = wal.enqueue("evt-3", b"x").await;
    assert!(matches!(result, Err(AgentError::HighWaterDropped)));
    assert_eq!(wal.depth().await.unwrap().0, 2);
  }

  #[tokio::test]
  async fn acked_records_are_compacted_in_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    cfg.purge_batch_size = 3;
    let wal = Wal::open(cfg).await.unwrap();

    for i in 0..3 {
      wal.enqueue(&format!("evt-{}", i), b"x").await.unwrap();
      let record = wal.next_ready().await.unwrap().unwrap();
      wal.mark_acked(record.seq).await.unwrap();
    }

    // The third ack crossed the purge threshold.
    assert_eq!(wal.purge_acked().await.unwrap(), 0);
  }
}
