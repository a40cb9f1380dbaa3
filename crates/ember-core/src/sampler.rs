//! Rate derivation from exporter snapshots.
//!
//! Rate readings pass straight through. Counter readings become a rate
//! from the delta against the key's previous counter value over the time
//! between the two snapshots. A counter that went backwards means the
//! exporter restarted: nothing is emitted for that tick and the new value
//! becomes the baseline. A key's first counter value only sets the
//! baseline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ember_types::{ContainerKey, Measurement};

use crate::exporter::{ExporterSnapshot, ReadingUnit};

#[derive(Debug, Clone, Copy)]
struct Baseline {
    joules: f64,
    at: DateTime<Utc>,
}

/// Turns snapshots into measurements, one per reporting key.
///
/// Baselines are owned by the sampler task and never shared.
#[derive(Debug, Default)]
pub struct Sampler {
    baselines: HashMap<ContainerKey, Baseline>,
}

impl Sampler {
    /// A sampler with no baselines.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a counter baseline.
    pub fn tracked(&self) -> usize {
        self.baselines.len()
    }

    /// Derive measurements from one snapshot.
    ///
    /// Every measurement is stamped with the snapshot's `taken_at`. Keys
    /// absent from the snapshot lose their baseline.
    pub fn process(&mut self, snapshot: &ExporterSnapshot) -> Vec<(ContainerKey, Measurement)> {
        self.baselines
            .retain(|key, _| snapshot.readings.contains_key(key));

        let mut out = Vec::with_capacity(snapshot.readings.len());
        for (key, reading) in &snapshot.readings {
            if !reading.value.is_finite() {
                tracing::warn!(key = %key, value = reading.value, "Non-finite reading skipped");
                continue;
            }
            let rate = match reading.unit {
                ReadingUnit::JoulesPerSecond => Some(reading.value),
                ReadingUnit::CumulativeJoules => {
                    self.counter_rate(key, reading.value, snapshot.taken_at)
                }
            };
            let Some(rate) = rate else {
                continue;
            };
            if rate < 0.0 {
                tracing::warn!(key = %key, rate, "Negative power reading skipped");
                continue;
            }
            out.push((key.clone(), Measurement::new(snapshot.taken_at, rate)));
        }

        tracing::debug!(
            readings = snapshot.readings.len(),
            measurements = out.len(),
            "Sampled exporter snapshot"
        );
        out
    }

    fn counter_rate(&mut self, key: &ContainerKey, joules: f64, at: DateTime<Utc>) -> Option<f64> {
        let current = Baseline { joules, at };
        let Some(previous) = self.baselines.insert(key.clone(), current) else {
            tracing::debug!(key = %key, "Counter baseline established");
            return None;
        };

        if joules < previous.joules {
            tracing::warn!(
                key = %key,
                previous = previous.joules,
                current = joules,
                "Energy counter reset, re-baselining"
            );
            return None;
        }

        let elapsed = at
            .signed_duration_since(previous.at)
            .to_std()
            .ok()
            .map(|d| d.as_secs_f64())
            .filter(|secs| *secs > 0.0);
        let Some(elapsed) = elapsed else {
            tracing::warn!(key = %key, "Counter snapshot not after baseline, skipped");
            return None;
        };

        Some((joules - previous.joules) / elapsed)
    }
}
