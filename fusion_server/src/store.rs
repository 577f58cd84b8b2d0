//! Incident and risk persistence.
//!
//! `incidents` is append-only keyed by the deterministic incident id, so a
//! rule re-emitting after a restart lands on `INSERT OR IGNORE`. `device_risk`
//! is a latest-wins upsert per device. List and object fields are stored as
//! JSON text columns.

use crate::error::FusionError;
use crate::risk::{DeviceRiskSnapshot, RiskLevel};
use crate::rules::{Incident, IncidentSeverity};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SCHEMA: &[&str] = &[
  "CREATE TABLE IF NOT EXISTS incidents (
     incident_id   TEXT PRIMARY KEY,
     device_id     TEXT NOT NULL,
     severity      TEXT NOT NULL,
     rule_name     TEXT NOT NULL,
     summary       TEXT NOT NULL,
     start_ts_ns   INTEGER NOT NULL,
     end_ts_ns     INTEGER NOT NULL,
     tactics       TEXT NOT NULL,
     techniques    TEXT NOT NULL,
     event_ids     TEXT NOT NULL,
     metadata      TEXT NOT NULL,
     created_at_ms INTEGER NOT NULL
   )",
  "CREATE INDEX IF NOT EXISTS idx_incidents_device_created
     ON incidents(device_id, created_at_ms)",
  "CREATE TABLE IF NOT EXISTS device_risk (
     device_id         TEXT PRIMARY KEY,
     score             INTEGER NOT NULL,
     level             TEXT NOT NULL,
     reason_tags       TEXT NOT NULL,
     supporting_events TEXT NOT NULL,
     updated_at_ms     INTEGER NOT NULL
   )",
];

#[derive(Debug, Clone)]
pub struct FusionStore {
  pool: SqlitePool,
}

impl FusionStore {
  pub async fn open(path: &Path) -> Result<Self, FusionError> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .synchronous(SqliteSynchronous::Normal)
      .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    for statement in SCHEMA {
      sqlx::query(statement).execute(&pool).await?;
    }

    info!(path = %path.display(), "Fusion store opened");
    Ok(Self { pool })
  }

  /// Append one incident. Returns `false` when the deterministic id already
  /// exists (re-emitted incident).
  pub async fn insert_incident(&self, incident: &Incident) -> Result<bool, FusionError> {
    let result = sqlx::query(
      "INSERT OR IGNORE INTO incidents
         (incident_id, device_id, severity, rule_name, summary, start_ts_ns, end_ts_ns,
          tactics, techniques, event_ids, metadata, created_at_ms)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&incident.incident_id)
    .bind(&incident.device_id)
    .bind(incident.severity.as_str())
    .bind(&incident.rule_name)
    .bind(&incident.summary)
    .bind(incident.start_ts_ns)
    .bind(incident.end_ts_ns)
    .bind(serde_json::to_string(&incident.tactics)?)
    .bind(serde_json::to_string(&incident.techniques)?)
    .bind(serde_json::to_string(&incident.event_ids)?)
    .bind(serde_json::to_string(&incident.metadata)?)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  /// Latest-wins risk snapshot per device.
  pub async fn upsert_risk(&self, snapshot: &DeviceRiskSnapshot) -> Result<(), FusionError> {
    sqlx::query(
      "INSERT INTO device_risk
         (device_id, score, level, reason_tags, supporting_events, updated_at_ms)
       VALUES (?, ?, ?, ?, ?, ?)
       ON CONFLICT(device_id) DO UPDATE SET
         score = excluded.score,
         level = excluded.level,
         reason_tags = excluded.reason_tags,
         supporting_events = excluded.supporting_events,
         updated_at_ms = excluded.updated_at_ms",
    )
    .bind(&snapshot.device_id)
    .bind(snapshot.score as i64)
    .bind(snapshot.level.as_str())
    .bind(serde_json::to_string(&snapshot.reason_tags)?)
    .bind(serde_json::to_string(&snapshot.supporting_events)?)
    .bind(snapshot.updated_at.timestamp_millis())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  /// Read-side query for the dashboard: newest incidents first.
  pub async fn recent_incidents(
    &self,
    device_id: Option<&str>,
    limit: i64,
  ) -> Result<Vec<Incident>, FusionError> {
    let rows = match device_id {
      Some(device_id) => {
        sqlx::query(
          "SELECT incident_id, device_id, severity, rule_name, summary, start_ts_ns,
                  end_ts_ns, tactics, techniques, event_ids, metadata
           FROM incidents WHERE device_id = ?
           ORDER BY created_at_ms DESC, incident_id LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
      }
      None => {
        sqlx::query(
          "SELECT incident_id, device_id, severity, rule_name, summary, start_ts_ns,
                  end_ts_ns, tactics, techniques, event_ids, metadata
           FROM incidents ORDER BY created_at_ms DESC, incident_id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
      }
    };

    rows.into_iter().map(Self::decode_incident).collect()
  }

  pub async fn device_risk(
    &self,
    device_id: &str,
  ) -> Result<Option<DeviceRiskSnapshot>, FusionError> {
    let row = sqlx::query(
      "SELECT device_id, score, level, reason_tags, supporting_events, updated_at_ms
       FROM device_risk WHERE device_id = ?",
    )
    .bind(device_id)
    .fetch_optional(&self.pool)
    .await?;

    let Some(row) = row else {
      return Ok(None);
    };

    let updated_at_ms: i64 = row.get("updated_at_ms");
    Ok(Some(DeviceRiskSnapshot {
      device_id: row.get("device_id"),
      score: row.get::<i64, _>("score") as u8,
      level: RiskLevel::parse(row.get("level")),
      reason_tags: serde_json::from_str(row.get("reason_tags"))?,
      supporting_events: serde_json::from_str(row.get("supporting_events"))?,
      updated_at: chrono::DateTime::from_timestamp_millis(updated_at_ms)
        .unwrap_or_else(chrono::Utc::now),
    }))
  }

  pub async fn healthy(&self) -> bool {
    sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
  }

  fn decode_incident(row: sqlx::sqlite::SqliteRow) -> Result<Incident, FusionError> {
    let metadata: BTreeMap<String, String> = serde_json::from_str(row.get("metadata"))?;
    Ok(Incident {
      incident_id: row.get("incident_id"),
      device_id: row.get("device_id"),
      severity: IncidentSeverity::parse(row.get("severity")),
      tactics: serde_json::from_str(row.get("tactics"))?,
      techniques: serde_json::from_str(row.get("techniques"))?,
      rule_name: row.get("rule_name"),
      summary: row.get("summary"),
      start_ts_ns: row.get("start_ts_ns"),
      end_ts_ns: row.get("end_ts_ns"),
      event_ids: serde_json::from_str(row.get("event_ids"))?,
      metadata,
    })
  }
}
