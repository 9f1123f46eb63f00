//! Change event envelope and outbox row types.

use crate::catalog_store::EntityType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time as unix milliseconds, the unit of every outbox timestamp.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Created,
    Updated,
    Deleted,
}

impl ChangeOperation {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            ChangeOperation::Created => "CREATED",
            ChangeOperation::Updated => "UPDATED",
            ChangeOperation::Deleted => "DELETED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(ChangeOperation::Created),
            "UPDATED" => Some(ChangeOperation::Updated),
            "DELETED" => Some(ChangeOperation::Deleted),
            _ => None,
        }
    }
}

/// The message delivered to the bus, one per committed mutation.
///
/// Consumers deduplicate on `(entity_type, entity_id, version)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEventEnvelope {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub operation: ChangeOperation,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<Vec<String>>,
}

/// An event about to be written to the outbox inside a catalog transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct NewChangeEvent {
    pub envelope: ChangeEventEnvelope,
    /// Entity id for parents, parent id for field events.
    pub partition_key: Uuid,
}

impl NewChangeEvent {
    pub fn created(entity_type: EntityType, entity_id: Uuid, partition_key: Uuid) -> Self {
        Self {
            envelope: ChangeEventEnvelope {
                entity_type,
                entity_id,
                operation: ChangeOperation::Created,
                version: 1,
                changed_fields: None,
            },
            partition_key,
        }
    }

    pub fn updated(
        entity_type: EntityType,
        entity_id: Uuid,
        partition_key: Uuid,
        version: u64,
        changed_fields: Vec<String>,
    ) -> Self {
        Self {
            envelope: ChangeEventEnvelope {
                entity_type,
                entity_id,
                operation: ChangeOperation::Updated,
                version,
                changed_fields: Some(changed_fields),
            },
            partition_key,
        }
    }

    pub fn deleted(
        entity_type: EntityType,
        entity_id: Uuid,
        partition_key: Uuid,
        version: u64,
    ) -> Self {
        Self {
            envelope: ChangeEventEnvelope {
                entity_type,
                entity_id,
                operation: ChangeOperation::Deleted,
                version,
                changed_fields: None,
            },
            partition_key,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    /// Bounded retries exhausted; redelivered after the park delay.
    Parked,
    Published,
    DeadLetter,
}

impl OutboxStatus {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Parked => "parked",
            OutboxStatus::Published => "published",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "parked" => Some(OutboxStatus::Parked),
            "published" => Some(OutboxStatus::Published),
            "dead_letter" => Some(OutboxStatus::DeadLetter),
            _ => None,
        }
    }

    pub fn is_undelivered(&self) -> bool {
        matches!(self, OutboxStatus::Pending | OutboxStatus::Parked)
    }
}

/// A stored outbox row. Payload columns are kept as stored so that a row which no
/// longer decodes can still be listed and dead-lettered.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    pub seq: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub partition_key: String,
    pub operation: String,
    pub version: i64,
    pub changed_fields: Option<String>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub published_at: Option<i64>,
}

impl OutboxRecord {
    /// Build the row for a freshly enqueued event.
    pub fn from_new_event(
        seq: i64,
        event: &NewChangeEvent,
        now_ms: i64,
    ) -> serde_json::Result<Self> {
        let envelope = &event.envelope;
        let changed_fields = envelope
            .changed_fields
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        Ok(Self {
            seq,
            entity_type: envelope.entity_type.to_db_str().to_string(),
            entity_id: envelope.entity_id.to_string(),
            partition_key: event.partition_key.to_string(),
            operation: envelope.operation.to_db_str().to_string(),
            version: envelope.version as i64,
            changed_fields,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now_ms,
            last_error: None,
            created_at: now_ms,
            published_at: None,
        })
    }

    /// Decode the stored columns back into an envelope.
    pub fn envelope(&self) -> Result<ChangeEventEnvelope, String> {
        let entity_type = EntityType::from_db_str(&self.entity_type)
            .ok_or_else(|| format!("Unknown entity type '{}'", self.entity_type))?;
        let entity_id = Uuid::parse_str(&self.entity_id)
            .map_err(|e| format!("Invalid entity id '{}': {}", self.entity_id, e))?;
        let operation = ChangeOperation::from_db_str(&self.operation)
            .ok_or_else(|| format!("Unknown operation '{}'", self.operation))?;
        if self.version < 1 {
            return Err(format!("Invalid version {}", self.version));
        }
        let changed_fields = match &self.changed_fields {
            Some(raw) => Some(
                serde_json::from_str::<Vec<String>>(raw)
                    .map_err(|e| format!("Invalid changed_fields '{}': {}", raw, e))?,
            ),
            None => None,
        };
        Ok(ChangeEventEnvelope {
            entity_type,
            entity_id,
            operation,
            version: self.version as u64,
            changed_fields,
        })
    }
}

/// Result of moving a dead letter back to pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    NotDeadLetter,
    /// A later event of the same partition was already published; delivering this
    /// one now would go back in version order.
    Superseded { published_seq: i64 },
}

/// Number of outbox rows per status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxCounts {
    pub pending: u64,
    pub parked: u64,
    pub published: u64,
    pub dead_letter: u64,
}

impl OutboxCounts {
    pub fn add(&mut self, status: OutboxStatus, count: u64) {
        match status {
            OutboxStatus::Pending => self.pending += count,
            OutboxStatus::Parked => self.parked += count,
            OutboxStatus::Published => self.published += count,
            OutboxStatus::DeadLetter => self.dead_letter += count,
        }
    }
}
