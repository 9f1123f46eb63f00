//! Background worker draining the change outbox into the message bus.
//!
//! Each round fetches at most one due event per partition (the partition head),
//! delivers the round concurrently in groups of `max_in_flight`, and records every
//! outcome before the next round starts. A partition therefore never has two
//! events in flight, while unrelated partitions publish in parallel.

use super::bus::{MessageBus, PublishError};
use super::models::{unix_millis_now, OutboxRecord, OutboxStatus};
use super::outbox::OutboxStore;
use super::retry_policy::{RetryDecision, RetryPolicy};
use crate::config::PublisherSettings;
use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Published,
    Retrying,
    Parked,
    DeadLettered,
}

/// Counters for one drain round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub fetched: usize,
    pub published: usize,
    pub retrying: usize,
    pub parked: usize,
    pub dead_lettered: usize,
    /// Deliveries whose outcome could not be recorded; they stay due.
    pub store_errors: usize,
}

impl RoundStats {
    fn record(&mut self, outcome: Result<DeliveryOutcome>) {
        match outcome {
            Ok(DeliveryOutcome::Published) => self.published += 1,
            Ok(DeliveryOutcome::Retrying) => self.retrying += 1,
            Ok(DeliveryOutcome::Parked) => self.parked += 1,
            Ok(DeliveryOutcome::DeadLettered) => self.dead_lettered += 1,
            Err(e) => {
                error!("Failed to record delivery outcome: {:#}", e);
                self.store_errors += 1;
            }
        }
    }
}

pub struct OutboxPublisher {
    outbox: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessageBus>,
    policy: RetryPolicy,
    wakeup: Arc<Notify>,
    poll_interval: Duration,
    batch_size: usize,
    max_in_flight: usize,
    publish_timeout: Duration,
}

impl OutboxPublisher {
    /// # Arguments
    /// * `outbox` - Store holding the change outbox
    /// * `bus` - Destination of the events
    /// * `settings` - Polling, concurrency and retry settings
    /// * `wakeup` - Notified by the catalog service after each committed mutation
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        bus: Arc<dyn MessageBus>,
        settings: &PublisherSettings,
        wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            outbox,
            bus,
            policy: RetryPolicy::new(settings),
            wakeup,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            batch_size: settings.batch_size.max(1),
            max_in_flight: settings.max_in_flight.max(1),
            publish_timeout: Duration::from_millis(settings.publish_timeout_ms),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Drain the outbox until `shutdown` is cancelled. A round in progress is
    /// always completed before stopping.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Outbox publisher started (poll every {:?}, batch {}, {} in flight)",
            self.poll_interval, self.batch_size, self.max_in_flight
        );

        loop {
            let more_work = match self.drain_round().await {
                Ok(stats) => {
                    if stats.fetched > 0 {
                        debug!("Outbox round: {:?}", stats);
                    }
                    stats.fetched == self.batch_size && stats.store_errors == 0
                }
                Err(e) => {
                    error!("Outbox drain round failed: {:#}", e);
                    false
                }
            };

            if shutdown.is_cancelled() {
                break;
            }
            if more_work {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wakeup.notified() => {
                    debug!("Outbox publisher woken up");
                }
                _ = shutdown.cancelled() => {
                    info!("Outbox publisher received shutdown signal");
                    break;
                }
            }
        }

        info!("Outbox publisher stopped");
    }

    /// Run one drain round and report what happened.
    pub async fn drain_round(&self) -> Result<RoundStats> {
        let now = unix_millis_now();
        let limit = self.batch_size;
        let due = self.store_call(move |o| o.fetch_due(now, limit)).await?;

        let mut stats = RoundStats {
            fetched: due.len(),
            ..Default::default()
        };
        for group in due.chunks(self.max_in_flight) {
            let outcomes = join_all(group.iter().map(|record| self.deliver(record))).await;
            for outcome in outcomes {
                stats.record(outcome);
            }
        }
        Ok(stats)
    }

    async fn deliver(&self, record: &OutboxRecord) -> Result<DeliveryOutcome> {
        let seq = record.seq;
        let attempts = record.attempts + 1;

        let envelope = match record.envelope() {
            Ok(envelope) => envelope,
            Err(reason) => {
                error!(
                    "Outbox event {} cannot be decoded, moving to dead letter: {}",
                    seq, reason
                );
                self.store_call(move |o| o.mark_dead_letter(seq, attempts, &reason))
                    .await?;
                return Ok(DeliveryOutcome::DeadLettered);
            }
        };

        let result = match tokio::time::timeout(
            self.publish_timeout,
            self.bus.publish(&record.partition_key, &envelope),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Transient(format!(
                "Publish timed out after {:?}",
                self.publish_timeout
            ))),
        };

        let now = unix_millis_now();
        let error = match result {
            Ok(()) => {
                debug!(
                    "Published {} {} {} v{}",
                    envelope.entity_type,
                    envelope.entity_id,
                    envelope.operation.to_db_str(),
                    envelope.version
                );
                self.store_call(move |o| o.mark_published(seq, now)).await?;
                return Ok(DeliveryOutcome::Published);
            }
            Err(error) => error,
        };

        let parked = record.status == OutboxStatus::Parked;
        let message = error.to_string();
        match self.policy.decide(&error, record.attempts, parked, now) {
            RetryDecision::RetryAt(at) => {
                warn!(
                    "Outbox event {} ({} {}) failed, retry {} in {}ms: {}",
                    seq,
                    envelope.entity_type,
                    envelope.entity_id,
                    attempts,
                    at - now,
                    message
                );
                self.store_call(move |o| o.mark_retry(seq, attempts, at, &message, false))
                    .await?;
                Ok(DeliveryOutcome::Retrying)
            }
            RetryDecision::ParkUntil(at) => {
                warn!(
                    "Outbox event {} ({} {}) parked after {} attempts: {}",
                    seq, envelope.entity_type, envelope.entity_id, attempts, message
                );
                self.store_call(move |o| o.mark_retry(seq, attempts, at, &message, true))
                    .await?;
                Ok(DeliveryOutcome::Parked)
            }
            RetryDecision::DeadLetter => {
                error!(
                    "Outbox event {} ({} {}) rejected, moving to dead letter: {}",
                    seq, envelope.entity_type, envelope.entity_id, message
                );
                self.store_call(move |o| o.mark_dead_letter(seq, attempts, &message))
                    .await?;
                Ok(DeliveryOutcome::DeadLettered)
            }
        }
    }

    /// Run a blocking outbox call off the async runtime.
    async fn store_call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn OutboxStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let outbox = self.outbox.clone();
        tokio::task::spawn_blocking(move || f(outbox.as_ref())).await?
    }
}

/// Delete published events older than `retention_days`. Returns the number deleted.
pub fn prune_published(
    outbox: &dyn OutboxStore,
    retention_days: u64,
    now_ms: i64,
) -> Result<usize> {
    let cutoff = now_ms - retention_days as i64 * MS_PER_DAY;
    let count = outbox.prune_published_before(cutoff)?;
    if count > 0 {
        info!("Pruned {} published outbox events", count);
    }
    Ok(count)
}
