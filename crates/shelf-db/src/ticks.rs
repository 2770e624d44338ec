//! Timestamp codec for the `created` / `last_modified` columns.
//!
//! Stored values are 100 ns ticks counted from 0001-01-01T00:00:00Z. Files
//! written by earlier versions of the store use this encoding, so it must
//! not change.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};

/// Ticks between 0001-01-01 and the Unix epoch
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

pub const TICKS_PER_SECOND: i64 = 10_000_000;

const NANOS_PER_TICK: i64 = 100;

/// Encode a timestamp, truncating to tick precision
pub fn to_ticks(ts: DateTime<Utc>) -> i64 {
    let secs = ts.timestamp();
    let sub = i64::from(ts.timestamp_subsec_nanos()) / NANOS_PER_TICK;
    secs.saturating_mul(TICKS_PER_SECOND)
        .saturating_add(UNIX_EPOCH_TICKS)
        .saturating_add(sub)
}

/// Decode a stored tick value
pub fn from_ticks(ticks: i64) -> Result<DateTime<Utc>> {
    let since_epoch = ticks
        .checked_sub(UNIX_EPOCH_TICKS)
        .ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {} ticks", ticks)))?;
    let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = since_epoch.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK;
    DateTime::from_timestamp(secs, nanos as u32)
        .ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {} ticks", ticks)))
}

pub fn now_ticks() -> i64 {
    to_ticks(Utc::now())
}
