//! Range and last-N emission queries.
//!
//! Buffered data comes from one [`SeriesSnapshot`], which also supplies
//! the seam: the timestamp of the oldest buffered measurement. Persisted
//! rows are read strictly before the seam and buffered rows at or after
//! it, so the two sources never overlap and no deduplication is needed.
//!
//! Store reads are bounded by the request timeout. A failed or slow read
//! degrades the answer to buffered data and flags it, rather than failing
//! the query.
//!
//! [`SeriesSnapshot`]: crate::buffer::SeriesSnapshot

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ember_db::{DbError, MetricsStore};
use ember_types::{
    Co2Query, Co2Response, ContainerKey, CountryCode, CountryEmission, CountryTotals, Measurement,
    MeasurementReport, QueryStatus, RequestError, Selection,
};

use crate::buffer::{BufferStore, SeriesSnapshot};
use crate::error::QueryError;
use crate::intensity::{IntensitySnapshot, IntensityTracker};

/// Joules in one kilowatt-hour.
const JOULES_PER_KWH: f64 = 3_600_000.0;

/// Serves emission queries over the buffer and the persistent store.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    buffer: Arc<BufferStore>,
    store: Option<MetricsStore>,
    intensity: Arc<IntensityTracker>,
    sample_interval_secs: f64,
    store_timeout: Duration,
}

impl QueryEngine {
    /// Create an engine. `store` is `None` when persistence is disabled.
    pub const fn new(
        buffer: Arc<BufferStore>,
        store: Option<MetricsStore>,
        intensity: Arc<IntensityTracker>,
        sample_interval: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            buffer,
            store,
            intensity,
            sample_interval_secs: sample_interval.as_secs_f64(),
            store_timeout,
        }
    }

    /// Answer a validated query.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Validation`] if a requested country is not
    /// tracked. Data problems never fail the query: missing data yields a
    /// `no_data` response and missing intensities are reported per country.
    pub async fn execute(&self, query: &Co2Query) -> Result<Co2Response, QueryError> {
        let Some(primary) = query.countries.first() else {
            return Err(RequestError::EmptyCountries.into());
        };
        if let Some(unsupported) = query.countries.iter().find(|c| !self.intensity.tracks(c)) {
            return Err(RequestError::UnsupportedCountry(unsupported.to_string()).into());
        }

        let snapshot = self.buffer.snapshot(&query.key);
        let (measurements, degraded) = match query.selection {
            Selection::Range { start, end } => self.range(&query.key, &snapshot, start, end).await,
            Selection::LastN(n) => self.last_n(&query.key, &snapshot, n.get()).await,
        };

        let (resolved_start, resolved_end) = match query.selection {
            Selection::Range { start, end } => (Some(start), Some(end)),
            Selection::LastN(_) => (
                measurements.first().map(|m| m.timestamp),
                measurements.last().map(|m| m.timestamp),
            ),
        };

        let intensity = self.intensity.snapshot();
        let (reports, per_country) = self.emissions(&measurements, &query.countries, primary, &intensity);

        tracing::debug!(
            key = %query.key,
            mode = ?query.selection.mode(),
            measurements = reports.len(),
            degraded,
            "Query served"
        );

        Ok(Co2Response {
            pod: query.key.pod.clone(),
            container: query.key.container.clone(),
            namespace: query.key.namespace.clone(),
            status: if reports.is_empty() {
                QueryStatus::NoData
            } else {
                QueryStatus::Ok
            },
            selection_mode: query.selection.mode(),
            measurement_count: reports.len(),
            resolved_start,
            resolved_end,
            primary_country: primary.clone(),
            sample_interval_seconds: self.sample_interval_secs,
            persistence_degraded: degraded,
            per_country,
            measurements: reports,
        })
    }

    /// `[start, end)` split at the seam: store before it, buffer after.
    async fn range(
        &self,
        key: &ContainerKey,
        snapshot: &SeriesSnapshot,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> (Vec<Measurement>, bool) {
        let buffered = snapshot.range(start, end);
        let persisted_end = snapshot.seam().map_or(end, |seam| seam.min(end));

        let Some(store) = self.store.as_ref().filter(|_| start < persisted_end) else {
            return (buffered, false);
        };
        match self
            .bounded(key, store.query_range(key, start, persisted_end))
            .await
        {
            Some(mut persisted) => {
                persisted.extend(buffered);
                (persisted, false)
            }
            None => (buffered, true),
        }
    }

    /// Newest `n` from the buffer, topped up from the store before the seam.
    async fn last_n(
        &self,
        key: &ContainerKey,
        snapshot: &SeriesSnapshot,
        n: usize,
    ) -> (Vec<Measurement>, bool) {
        let buffered = snapshot.last_n(n);
        let missing = n.saturating_sub(buffered.len());
        let Some(store) = self.store.as_ref().filter(|_| missing > 0) else {
            return (buffered, false);
        };
        match self
            .bounded(key, store.query_last_n(key, snapshot.seam(), missing))
            .await
        {
            Some(mut older) => {
                older.extend(buffered);
                (older, false)
            }
            None => (buffered, true),
        }
    }

    async fn bounded<T>(
        &self,
        key: &ContainerKey,
        read: impl Future<Output = Result<T, DbError>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.store_timeout, read).await {
            Ok(Ok(rows)) => Some(rows),
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Store read failed, serving buffered data only");
                None
            }
            Err(_) => {
                tracing::warn!(
                    key = %key,
                    timeout_ms = u64::try_from(self.store_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Store read timed out, serving buffered data only"
                );
                None
            }
        }
    }

    /// Per-measurement and per-country figures (rectangle rule).
    fn emissions(
        &self,
        measurements: &[Measurement],
        countries: &[CountryCode],
        primary: &CountryCode,
        intensity: &IntensitySnapshot,
    ) -> (Vec<MeasurementReport>, BTreeMap<CountryCode, CountryTotals>) {
        let mut totals: BTreeMap<CountryCode, CountryTotals> = countries
            .iter()
            .map(|c| {
                (
                    c.clone(),
                    CountryTotals {
                        co2_g: Some(0.0),
                        energy_j: 0.0,
                        missing_intensity: 0,
                        error_kind: None,
                    },
                )
            })
            .collect();

        let reports = measurements
            .iter()
            .map(|m| {
                let energy_j = m.joules_per_second * self.sample_interval_secs;
                let mut per_country = BTreeMap::new();

                for country in countries {
                    let lookup = intensity.at(country, m.timestamp);
                    let emission = match &lookup {
                        Ok(value) => CountryEmission {
                            intensity_g_per_kwh: Some(*value),
                            co2_gps: Some(m.joules_per_second / JOULES_PER_KWH * value),
                            co2_g: Some(energy_j / JOULES_PER_KWH * value),
                        },
                        Err(_) => CountryEmission {
                            intensity_g_per_kwh: None,
                            co2_gps: None,
                            co2_g: None,
                        },
                    };

                    if let Some(total) = totals.get_mut(country) {
                        total.energy_j += energy_j;
                        match (emission.co2_g, &lookup) {
                            (Some(g), _) => total.co2_g = total.co2_g.map(|sum| sum + g),
                            (None, Err(e)) => {
                                total.co2_g = None;
                                total.missing_intensity = total.missing_intensity.saturating_add(1);
                                total.error_kind = Some(e.kind().to_owned());
                            }
                            (None, Ok(_)) => {}
                        }
                    }
                    per_country.insert(country.clone(), emission);
                }

                let primary_emission = per_country.get(primary).copied();
                MeasurementReport {
                    timestamp: m.timestamp,
                    joules_per_second: m.joules_per_second,
                    energy_j,
                    co2_gps: primary_emission.and_then(|e| e.co2_gps),
                    co2_g: primary_emission.and_then(|e| e.co2_g),
                    intensity_g_per_kwh: primary_emission.and_then(|e| e.intensity_g_per_kwh),
                    per_country,
                }
            })
            .collect();

        (reports, totals)
    }
}
