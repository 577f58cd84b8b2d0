//! Background publisher: drains the WAL in `seq` order and drives the
//! per-record state machine from the bus's acks.

use crate::client::PublishTransport;
use crate::config::PublisherConfig;
use crate::error::AgentError;
use crate::wal::{Wal, WalRecord};
use amoskys_core::RetryPolicy;
use amoskys_protos::amoskys::v1::{publish_ack::Status as AckStatus, Envelope, PublishAck};
use metrics::{counter, histogram};
use prost::Message;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct Publisher {
  wal: Arc<Wal>,
  transport: Arc<dyn PublishTransport>,
  retry: RetryPolicy,
  config: PublisherConfig,
}

impl Publisher {
  pub fn new(
    wal: Arc<Wal>,
    transport: Arc<dyn PublishTransport>,
    retry: RetryPolicy,
    config: PublisherConfig,
  ) -> Self {
    Self {
      wal,
      transport,
      retry,
      config,
    }
  }

  /// Serial drain loop. Runs until the shutdown channel fires, then parks
  /// any IN_FLIGHT record back to PENDING and returns.
  pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
    info!("Publisher started");
    let mut holdoff_ms: u64 = 0;

    loop {
      match self.drain_once().await {
        Ok(DrainOutcome::Delivered) => {
          holdoff_ms = 0;
          // Keep draining a backlog, but stay responsive to shutdown.
          match shutdown.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => continue,
            _ => {
              self.park_and_stop().await;
              return;
            }
          }
        }
        Ok(DrainOutcome::Overloaded) => {
          // Repeated OVERLOAD extends the pause multiplicatively so a
          // recovering bus is not stormed by the whole fleet at once.
          holdoff_ms = (holdoff_ms.max(self.config.poll_interval_ms) * 2)
            .min(self.config.overload_holdoff_cap_ms);
          debug!(holdoff_ms, "Bus overloaded, holding off");
        }
        Ok(DrainOutcome::Rescheduled) | Ok(DrainOutcome::Idle) => {}
        Err(e) => warn!("Publisher drain error: {}", e),
      }

      let sleep_ms = self.config.poll_interval_ms.max(holdoff_ms);
      tokio::select! {
        _ = shutdown.recv() => {
          self.park_and_stop().await;
          return;
        }
        _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
      }
    }
  }

  /// Graceful stop: IN_FLIGHT records go back to PENDING so the next run
  /// redelivers them.
  async fn park_and_stop(&self) {
    if let Err(e) = self.wal.recover_inflight().await {
      warn!("Failed to park in-flight records on shutdown: {}", e);
    }
    info!("Publisher stopped");
  }

  /// Deliver at most one record. Split out from `run` so tests can step the
  /// state machine deterministically.
  pub async fn drain_once(&self) -> Result<DrainOutcome, AgentError> {
    let Some(record) = self.wal.next_ready().await? else {
      return Ok(DrainOutcome::Idle);
    };

    let envelope = match Envelope::decode(record.envelope.as_slice()) {
      Ok(envelope) => envelope,
      Err(e) => {
        // A corrupt WAL row can never succeed; treat like INVALID.
        warn!(seq = record.seq, "Undecodable WAL record: {}", e);
        self.wal.dead_letter(&record, "decode_error").await?;
        return Ok(DrainOutcome::Delivered);
      }
    };

    let start = Instant::now();
    let response = self.transport.publish(envelope).await;
    histogram!("publish_latency_seconds").record(start.elapsed().as_secs_f64());

    match response {
      Ok(ack) => self.apply_ack(&record, ack).await,
      Err(e) if e.is_retryable() => {
        // Transport failures are indistinguishable from RETRY.
        counter!("publish_attempts_total", "outcome" => "transport_error").increment(1);
        debug!(seq = record.seq, "Publish transport error: {}", e);
        self.reschedule(&record).await?;
        Ok(DrainOutcome::Rescheduled)
      }
      Err(e) => {
        // A non-retryable local failure can never succeed; treat it like an
        // INVALID ack rather than spinning on the same record.
        counter!("publish_attempts_total", "outcome" => "permanent_error").increment(1);
        warn!(seq = record.seq, "Permanent publish error, dead-lettering: {}", e);
        self.wal.dead_letter(&record, "permanent_error").await?;
        Ok(DrainOutcome::Delivered)
      }
    }
  }

  async fn apply_ack(
    &self,
    record: &WalRecord,
    ack: PublishAck,
  ) -> Result<DrainOutcome, AgentError> {
    match AckStatus::try_from(ack.status) {
      Ok(AckStatus::Ok) => {
        counter!("publish_attempts_total", "outcome" => "ok").increment(1);
        self.wal.mark_acked(record.seq).await?;
        Ok(DrainOutcome::Delivered)
      }
      Ok(AckStatus::Retry) => {
        counter!("publish_attempts_total", "outcome" => "retry").increment(1);
        self.reschedule(record).await?;
        Ok(DrainOutcome::Rescheduled)
      }
      Ok(AckStatus::Overload) => {
        counter!("publish_attempts_total", "outcome" => "overload").increment(1);
        self.reschedule(record).await?;
        Ok(DrainOutcome::Overloaded)
      }
      Ok(AckStatus::Invalid) => {
        counter!("publish_attempts_total", "outcome" => "invalid").increment(1);
        warn!(
          seq = record.seq,
          event_id = %record.event_id,
          detail = %ack.detail,
          "Envelope permanently rejected, dead-lettering"
        );
        self.wal.dead_letter(record, "invalid").await?;
        Ok(DrainOutcome::Delivered)
      }
      Ok(AckStatus::Unspecified) | Err(_) => {
        // An unknown status means a newer bus; safest to retry.
        counter!("publish_attempts_total", "outcome" => "unknown_status").increment(1);
        self.reschedule(record).await?;
        Ok(DrainOutcome::Rescheduled)
      }
    }
  }

  async fn reschedule(&self, record: &WalRecord) -> Result<(), AgentError> {
    let delay = self.retry.next_delay(record.attempts + 1);
    let next_attempt_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
    self.wal.reschedule(record.seq, next_attempt_ms).await
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  /// A record reached a terminal state (acked or dead-lettered).
  Delivered,
  /// A record was sent but must be retried later.
  Rescheduled,
  /// The bus rejected for capacity; the caller should hold off.
  Overloaded,
  /// Nothing was ready to send.
  Idle,
}
