//! Shared constants for end-to-end tests

use chrono::NaiveDate;

pub const AUTHOR_1: &str = "rlh";
pub const AUTHOR_2: &str = "mgz";

/// Upper bound for a test waiting on the publisher.
pub const DRAIN_TIMEOUT_MS: u64 = 5_000;

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}
