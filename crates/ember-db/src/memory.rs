//! In-process backend with the same contract as [`PostgresStore`].
//!
//! Rows live in ordered maps keyed by container and timestamp, so inserts
//! are naturally idempotent and range reads come back sorted. Used when
//! persistence is disabled in tests and for dry runs. It can be told to
//! fail upcoming writes to exercise retry paths.
//!
//! [`PostgresStore`]: crate::PostgresStore

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use ember_types::{Block, ContainerKey, CountryCode, IntensityPoint, Measurement};

use crate::error::DbError;

#[derive(Debug, Default)]
struct Tables {
    metrics: BTreeMap<ContainerKey, BTreeMap<DateTime<Utc>, f64>>,
    intensity: BTreeMap<(CountryCode, DateTime<Utc>), f64>,
}

/// Metrics store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing_writes: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write operations fail with [`DbError::Unavailable`].
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Total number of stored measurement rows.
    pub fn row_count(&self) -> usize {
        self.lock().metrics.values().map(BTreeMap::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_write(&self) -> Result<(), DbError> {
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(DbError::Unavailable(String::from(
                "simulated write failure",
            ))),
            Err(_) => Ok(()),
        }
    }

    /// Insert a block's measurements, ignoring existing timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Unavailable`] while simulated failures remain.
    pub fn insert_block(&self, block: &Block) -> Result<u64, DbError> {
        self.check_write()?;
        let mut tables = self.lock();
        let series = tables.metrics.entry(block.key().clone()).or_default();
        let mut inserted: u64 = 0;
        for m in block.measurements() {
            if !series.contains_key(&m.timestamp) {
                series.insert(m.timestamp, m.joules_per_second);
                inserted = inserted.saturating_add(1);
            }
        }
        Ok(inserted)
    }

    /// Measurements for `key` with `start <= time < end`, ascending.
    pub fn query_range(
        &self,
        key: &ContainerKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Measurement> {
        if start >= end {
            return Vec::new();
        }
        self.lock().metrics.get(key).map_or_else(Vec::new, |series| {
            series
                .range(start..end)
                .map(|(ts, jps)| Measurement::new(*ts, *jps))
                .collect()
        })
    }

    /// The `n` most recent measurements strictly before `before`, ascending.
    pub fn query_last_n(
        &self,
        key: &ContainerKey,
        before: Option<DateTime<Utc>>,
        n: usize,
    ) -> Vec<Measurement> {
        let tables = self.lock();
        let Some(series) = tables.metrics.get(key) else {
            return Vec::new();
        };
        let mut picked: Vec<Measurement> = match before {
            Some(bound) => series
                .range(..bound)
                .rev()
                .take(n)
                .map(|(ts, jps)| Measurement::new(*ts, *jps))
                .collect(),
            None => series
                .iter()
                .rev()
                .take(n)
                .map(|(ts, jps)| Measurement::new(*ts, *jps))
                .collect(),
        };
        picked.reverse();
        picked
    }

    /// Every key with at least one stored row.
    pub fn list_keys(&self) -> Vec<ContainerKey> {
        self.lock()
            .metrics
            .iter()
            .filter(|(_, series)| !series.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Upsert intensity points, last write wins.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Unavailable`] while simulated failures remain.
    pub fn insert_intensities(&self, points: &[IntensityPoint]) -> Result<u64, DbError> {
        self.check_write()?;
        let mut tables = self.lock();
        for p in points {
            tables
                .intensity
                .insert((p.country.clone(), p.hour), p.value_g_per_kwh);
        }
        Ok(u64::try_from(points.len()).unwrap_or(u64::MAX))
    }

    /// Intensity points with `hour >= since`, ordered by country and hour.
    pub fn load_intensities(&self, since: DateTime<Utc>) -> Vec<IntensityPoint> {
        self.lock()
            .intensity
            .iter()
            .filter(|((_, hour), _)| *hour >= since)
            .map(|((country, hour), value)| IntensityPoint {
                country: country.clone(),
                hour: *hour,
                value_g_per_kwh: *value,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn key() -> ContainerKey {
        ContainerKey::new("pod", "app", "default")
    }

    fn block(start: i64, samples: &[i64]) -> Block {
        Block::with_measurements(
            key(),
            at(start),
            at(start + 50),
            samples.iter().map(|s| Measurement::new(at(*s), 100.0)),
        )
        .unwrap()
    }

    #[test]
    fn range_read_returns_block_in_order() {
        let store = MemoryStore::new();
        let b = block(0, &[0, 10, 20, 30, 40]);
        store.insert_block(&b).unwrap();
        assert_eq!(store.query_range(&key(), at(0), at(50)), b.measurements());
    }

    #[test]
    fn reinserting_a_block_adds_no_rows() {
        let store = MemoryStore::new();
        let b = block(0, &[0, 10, 20]);
        assert_eq!(store.insert_block(&b).unwrap(), 3);
        assert_eq!(store.insert_block(&b).unwrap(), 0);
        assert_eq!(store.row_count(), 3);
    }

    #[test]
    fn last_n_honours_before_bound() {
        let store = MemoryStore::new();
        store.insert_block(&block(0, &[0, 10, 20, 30, 40])).unwrap();
        store.insert_block(&block(50, &[50, 60])).unwrap();

        let picked: Vec<_> = store
            .query_last_n(&key(), Some(at(50)), 2)
            .iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(picked, vec![at(30), at(40)]);
        assert_eq!(store.query_last_n(&key(), None, 10).len(), 7);
    }

    #[test]
    fn simulated_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_writes(2);
        let b = block(0, &[0]);
        assert!(matches!(store.insert_block(&b), Err(DbError::Unavailable(_))));
        assert!(store.insert_block(&b).is_err());
        assert_eq!(store.insert_block(&b).unwrap(), 1);
    }

    #[test]
    fn intensities_are_last_write_wins() {
        let store = MemoryStore::new();
        let de = CountryCode::parse("DE").unwrap();
        let point = |v| IntensityPoint {
            country: de.clone(),
            hour: at(3600),
            value_g_per_kwh: v,
        };
        store.insert_intensities(&[point(300.0)]).unwrap();
        store.insert_intensities(&[point(400.0)]).unwrap();

        let loaded = store.load_intensities(at(0));
        assert_eq!(loaded, vec![point(400.0)]);
        assert!(store.load_intensities(at(7200)).is_empty());
    }
}
