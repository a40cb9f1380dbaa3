//! Epoch-aligned block grid and hour bucketing.
//!
//! All containers share one grid: cell `k` covers
//! `[epoch + k * duration, epoch + (k + 1) * duration)`. Because every key
//! closes its blocks at the same wall-clock instants, the boundary between
//! buffered and persisted data for any key is always a grid line.

use chrono::{DateTime, TimeDelta, Utc};

/// Seconds in one hour bucket.
const SECS_PER_HOUR: i64 = 3600;

/// Invalid grid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    /// The block duration is zero, negative, or not whole milliseconds.
    #[error("block duration must be a positive whole number of milliseconds, got {0}")]
    InvalidDuration(TimeDelta),
}

/// Fixed-duration grid anchored at the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGrid {
    duration: TimeDelta,
    step_ms: i64,
}

impl BlockGrid {
    /// Create a grid with the given cell duration.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::InvalidDuration`] unless the duration is a
    /// positive whole number of milliseconds.
    pub fn new(duration: TimeDelta) -> Result<Self, GridError> {
        let step_ms = duration.num_milliseconds();
        let whole_ms = TimeDelta::try_milliseconds(step_ms) == Some(duration);
        if step_ms <= 0 || !whole_ms {
            return Err(GridError::InvalidDuration(duration));
        }
        Ok(Self { duration, step_ms })
    }

    /// Create a grid with a cell duration in whole seconds.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::InvalidDuration`] for zero or out-of-range input.
    pub fn from_secs(secs: u64) -> Result<Self, GridError> {
        let duration = i64::try_from(secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::zero());
        Self::new(duration)
    }

    /// Length of one cell.
    pub const fn duration(&self) -> TimeDelta {
        self.duration
    }

    /// Start of the cell containing `ts`.
    pub fn cell_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ms = ts.timestamp_millis();
        ms.checked_div_euclid(self.step_ms)
            .and_then(|k| k.checked_mul(self.step_ms))
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(ts)
    }

    /// `[start, end)` of the cell containing `ts`.
    pub fn cell(&self, ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.cell_start(ts);
        let end = start
            .checked_add_signed(self.duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (start, end)
    }

    /// Whether `ts` lies exactly on a grid line.
    pub fn is_boundary(&self, ts: DateTime<Utc>) -> bool {
        self.cell_start(ts) == ts
    }
}

/// Start of the UTC hour containing `ts`.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.timestamp()
        .checked_div_euclid(SECS_PER_HOUR)
        .and_then(|h| h.checked_mul(SECS_PER_HOUR))
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(ts)
}
