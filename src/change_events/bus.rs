//! Message bus seam and its implementations.

use super::models::ChangeEventEnvelope;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Failure to deliver one event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The bus may accept the event later (network error, timeout, 5xx).
    #[error("Transient publish failure: {0}")]
    Transient(String),

    /// The event will never be accepted as is (malformed payload, 4xx).
    #[error("Permanent publish failure: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

/// Destination for change events. Delivery is at-least-once, so implementations
/// may see the same `(entity_type, entity_id, version)` more than once.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        partition_key: &str,
        envelope: &ChangeEventEnvelope,
    ) -> Result<(), PublishError>;
}

// =============================================================================
// HTTP
// =============================================================================

/// POSTs the envelope JSON to a single endpoint, routing by `X-Partition-Key`.
#[derive(Clone)]
pub struct HttpMessageBus {
    client: Client,
    url: String,
}

impl HttpMessageBus {
    /// # Arguments
    /// * `url` - Endpoint receiving the events (e.g., "http://cache:8080/events")
    /// * `timeout` - Per-request timeout
    pub fn new(url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Maps a non-success HTTP status to a publish error.
fn classify_status(status: StatusCode) -> PublishError {
    let message = format!("Bus responded with status {}", status);
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        PublishError::Transient(message)
    } else if status.is_client_error() {
        PublishError::Permanent(message)
    } else {
        PublishError::Transient(message)
    }
}

#[async_trait]
impl MessageBus for HttpMessageBus {
    async fn publish(
        &self,
        partition_key: &str,
        envelope: &ChangeEventEnvelope,
    ) -> Result<(), PublishError> {
        let idempotency_key = format!(
            "{}:{}:{}",
            envelope.entity_type, envelope.entity_id, envelope.version
        );
        let response = self
            .client
            .post(&self.url)
            .header("X-Partition-Key", partition_key)
            .header("Idempotency-Key", idempotency_key)
            .json(envelope)
            .send()
            .await
            .map_err(|e| PublishError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(classify_status(status))
        }
    }
}

// =============================================================================
// Log
// =============================================================================

/// Logs every event and reports success. Used when no bus endpoint is configured.
#[derive(Clone, Default)]
pub struct LogMessageBus;

#[async_trait]
impl MessageBus for LogMessageBus {
    async fn publish(
        &self,
        partition_key: &str,
        envelope: &ChangeEventEnvelope,
    ) -> Result<(), PublishError> {
        info!(
            "Change event [{}] {} {} {} v{} {:?}",
            partition_key,
            envelope.entity_type,
            envelope.entity_id,
            envelope.operation.to_db_str(),
            envelope.version,
            envelope.changed_fields
        );
        Ok(())
    }
}

// =============================================================================
// Recording
// =============================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory bus that records deliveries and fails on demand.
#[derive(Default)]
pub struct RecordingMessageBus {
    delivered: Mutex<Vec<(String, ChangeEventEnvelope)>>,
    scripted_failures: Mutex<VecDeque<PublishError>>,
    rejected_entities: Mutex<HashSet<Uuid>>,
    attempts: Mutex<usize>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next publish call with `error`. Calls queue up in order.
    pub fn fail_next(&self, error: PublishError) {
        lock(&self.scripted_failures).push_back(error);
    }

    /// Permanently reject every event about `entity_id`.
    pub fn reject_entity(&self, entity_id: Uuid) {
        lock(&self.rejected_entities).insert(entity_id);
    }

    /// Sleep for `delay` inside every publish call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn delivered(&self) -> Vec<(String, ChangeEventEnvelope)> {
        lock(&self.delivered).clone()
    }

    pub fn delivered_for(&self, entity_id: Uuid) -> Vec<ChangeEventEnvelope> {
        lock(&self.delivered)
            .iter()
            .filter(|(_, envelope)| envelope.entity_id == entity_id)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        *lock(&self.attempts)
    }
}

#[async_trait]
impl MessageBus for RecordingMessageBus {
    async fn publish(
        &self,
        partition_key: &str,
        envelope: &ChangeEventEnvelope,
    ) -> Result<(), PublishError> {
        *lock(&self.attempts) += 1;

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.rejected_entities).contains(&envelope.entity_id) {
            return Err(PublishError::Permanent(format!(
                "Entity {} rejected",
                envelope.entity_id
            )));
        }
        if let Some(error) = lock(&self.scripted_failures).pop_front() {
            return Err(error);
        }

        lock(&self.delivered).push((partition_key.to_string(), envelope.clone()));
        Ok(())
    }
}
