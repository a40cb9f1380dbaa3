//! Sampler health and readiness reports.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::flush::FlushStatsSnapshot;

/// Grace added to three sample intervals before the sampler counts as
/// stale.
const STALENESS_GRACE_SECS: i64 = 5;

#[derive(Debug, Default)]
struct SampleStatus {
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Outcome of the sampler's most recent polls.
#[derive(Debug, Default)]
pub struct HealthState {
    status: RwLock<SampleStatus>,
}

impl HealthState {
    /// Fresh state with no samples recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful poll at `at`; clears the last error.
    pub fn record_success(&self, at: DateTime<Utc>) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.last_success = Some(at);
        status.last_error = None;
    }

    /// Record a failed poll.
    pub fn record_error(&self, message: impl Into<String>) {
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error = Some(message.into());
    }

    /// When the last poll succeeded.
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_success
    }

    /// Error of the last failed poll, if it was not followed by a success.
    pub fn last_error(&self) -> Option<String> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }
}

/// Maximum age of the last successful sample: three intervals plus five
/// seconds.
pub fn staleness_threshold(sample_interval_secs: u64) -> TimeDelta {
    i64::try_from(sample_interval_secs)
        .ok()
        .and_then(|s| s.checked_mul(3))
        .and_then(|s| s.checked_add(STALENESS_GRACE_SECS))
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// Readiness report served by `/readyz`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    /// Whether every check passed.
    pub ready: bool,
    /// Why the collector is not ready; empty when ready.
    pub reasons: Vec<String>,
    /// When the sampler last succeeded.
    pub last_sample_success: Option<DateTime<Utc>>,
    /// The sampler's last unresolved error.
    pub last_sample_error: Option<String>,
    /// Flush counters, when persistence is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush: Option<FlushStatsSnapshot>,
}
