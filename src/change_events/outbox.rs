//! Storage seam used by the publisher and by operator tooling.

use super::models::{OutboxCounts, OutboxRecord, RequeueOutcome};
use anyhow::Result;

/// Access to the durable change outbox.
///
/// Rows are only ever inserted by catalog transactions; this trait covers the
/// delivery side: finding due events and recording delivery outcomes.
pub trait OutboxStore: Send + Sync {
    /// Undelivered events that are the head of their partition and due at `now_ms`,
    /// ordered by `seq`. At most one row per partition is returned.
    fn fetch_due(&self, now_ms: i64, limit: usize) -> Result<Vec<OutboxRecord>>;

    fn mark_published(&self, seq: i64, now_ms: i64) -> Result<()>;

    /// Record a failed attempt and reschedule. `parked` moves the row out of the
    /// active retry sequence until `next_attempt_at`.
    fn mark_retry(
        &self,
        seq: i64,
        attempts: u32,
        next_attempt_at: i64,
        error: &str,
        parked: bool,
    ) -> Result<()>;

    fn mark_dead_letter(&self, seq: i64, attempts: u32, error: &str) -> Result<()>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Move a dead-lettered event back to pending, unless a later event of its
    /// partition has already been published.
    fn requeue_dead_letter(&self, seq: i64, now_ms: i64) -> Result<RequeueOutcome>;

    fn status_counts(&self) -> Result<OutboxCounts>;

    /// Delete published rows whose `published_at` is before `cutoff_ms`. Rows that
    /// follow a dead letter of their partition are kept, as they are what
    /// `requeue_dead_letter` checks against.
    fn prune_published_before(&self, cutoff_ms: i64) -> Result<usize>;

    /// All rows of one partition in `seq` order.
    fn partition_events(&self, partition_key: &str) -> Result<Vec<OutboxRecord>>;
}
