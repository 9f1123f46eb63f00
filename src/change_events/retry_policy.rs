//! Retry policy for failed event deliveries.
//!
//! Implements bounded exponential backoff; once the bounded retries are used up the
//! event is parked for `park_duration_ms` instead of being dropped.

use super::bus::PublishError;
use crate::config::PublisherSettings;

/// Retry policy implementing exponential backoff with parking.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries before the event is parked.
    pub max_retries: u32,
    /// Initial backoff in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds (cap for exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff after each retry.
    pub backoff_multiplier: f64,
    /// Delay before a parked event is attempted again.
    pub park_duration_ms: u64,
}

/// What to do with an event after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(i64),
    ParkUntil(i64),
    DeadLetter,
}

impl RetryPolicy {
    pub fn new(config: &PublisherSettings) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
            park_duration_ms: config.park_duration_secs * 1000,
        }
    }

    /// Backoff for a given retry count: `initial_backoff * multiplier^retry_count`,
    /// capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_ms as f64) as u64
    }

    /// True if `error` is retryable and fewer than `max_retries` retries happened.
    pub fn should_retry(&self, error: &PublishError, retry_count: u32) -> bool {
        error.is_retryable() && retry_count < self.max_retries
    }

    /// Decide the next step for an event that failed with `error`.
    ///
    /// `retry_count` is the number of failed attempts before this one; `parked`
    /// tells whether the event was already parked, in which case a transient
    /// failure parks it again.
    pub fn decide(
        &self,
        error: &PublishError,
        retry_count: u32,
        parked: bool,
        now_ms: i64,
    ) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::DeadLetter;
        }
        if !parked && self.should_retry(error, retry_count) {
            RetryDecision::RetryAt(now_ms + self.backoff_ms(retry_count) as i64)
        } else {
            RetryDecision::ParkUntil(now_ms + self.park_duration_ms as i64)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&PublisherSettings::default())
    }
}
