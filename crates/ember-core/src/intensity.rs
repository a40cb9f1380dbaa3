//! Carbon-intensity cache and its upstream sources.
//!
//! The tracker keeps, per tracked country, an hour-bucketed history of
//! intensity values. Readers get an [`Arc`] to the latest fully built
//! [`IntensitySnapshot`]; a refresh fetches every country concurrently,
//! builds a new snapshot off to the side, and swaps it in with one write.
//! A country whose fetch fails keeps its previous values.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use ember_types::{CountryCode, IntensityPoint, hour_bucket};
use futures::future::join_all;

use crate::error::IntensityError;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable view of all known intensity values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntensitySnapshot {
    refreshed_at: Option<DateTime<Utc>>,
    history: BTreeMap<CountryCode, BTreeMap<DateTime<Utc>, f64>>,
}

impl IntensitySnapshot {
    /// When the last successful refresh completed.
    pub const fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    /// Value for the hour containing `at`, or the nearest earlier hour.
    ///
    /// # Errors
    ///
    /// Returns [`IntensityError::NoIntensityData`] if no value exists at
    /// or before that hour.
    pub fn at(&self, country: &CountryCode, at: DateTime<Utc>) -> Result<f64, IntensityError> {
        self.history
            .get(country)
            .and_then(|hours| hours.range(..=hour_bucket(at)).next_back())
            .map(|(_, value)| *value)
            .ok_or_else(|| IntensityError::NoIntensityData {
                country: country.clone(),
                at,
            })
    }

    /// The most recent point per country.
    pub fn latest(&self) -> Vec<IntensityPoint> {
        self.history
            .iter()
            .filter_map(|(country, hours)| {
                hours.last_key_value().map(|(hour, value)| IntensityPoint {
                    country: country.clone(),
                    hour: *hour,
                    value_g_per_kwh: *value,
                })
            })
            .collect()
    }

    /// Number of stored points across all countries.
    pub fn point_count(&self) -> usize {
        self.history.values().map(BTreeMap::len).sum()
    }

    fn merge(&mut self, points: impl IntoIterator<Item = IntensityPoint>) {
        for p in points {
            self.history
                .entry(p.country)
                .or_default()
                .insert(hour_bucket(p.hour), p.value_g_per_kwh);
        }
    }

    /// Drop hours before `cutoff`, keeping per country the newest hour at
    /// or before it so lookups at the cutoff still resolve.
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        for hours in self.history.values_mut() {
            let mut kept = hours.split_off(&cutoff);
            let floor = hours.pop_last().filter(|_| !kept.contains_key(&cutoff));
            if let Some((hour, value)) = floor {
                kept.insert(hour, value);
            }
            *hours = kept;
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Upstream provider of current intensity values.
///
/// Uses enum dispatch instead of trait objects because async methods
/// are not dyn-compatible.
#[derive(Debug)]
pub enum IntensitySource {
    /// Fixed per-country table.
    Static(BTreeMap<CountryCode, f64>),
    /// Electricity Maps compatible HTTP API.
    ElectricityMaps(ElectricityMapsSource),
}

impl IntensitySource {
    /// Current intensity for `country` in g/kWh.
    ///
    /// # Errors
    ///
    /// Returns [`IntensityError::Upstream`] if the value is unavailable.
    pub async fn fetch(&self, country: &CountryCode) -> Result<f64, IntensityError> {
        match self {
            Self::Static(table) => {
                table
                    .get(country)
                    .copied()
                    .ok_or_else(|| IntensityError::Upstream {
                        country: country.clone(),
                        message: String::from("no static value configured"),
                    })
            }
            Self::ElectricityMaps(source) => source.fetch(country).await,
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Static(_) => "static",
            Self::ElectricityMaps(_) => "electricity_maps",
        }
    }
}

/// Client for `GET {api_url}/carbon-intensity/latest?zone=XX`.
#[derive(Debug)]
pub struct ElectricityMapsSource {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl ElectricityMapsSource {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure if the HTTP client cannot be
    /// built.
    pub fn new(api_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("HTTP client build failed: {e}"))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_owned(),
            token,
        })
    }

    async fn fetch(&self, country: &CountryCode) -> Result<f64, IntensityError> {
        let upstream = |message: String| IntensityError::Upstream {
            country: country.clone(),
            message,
        };
        let url = format!("{}/carbon-intensity/latest", self.api_url);

        let mut request = self.client.get(&url).query(&[("zone", country.as_str())]);
        if let Some(token) = &self.token {
            request = request.header("auth-token", token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| upstream(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream(format!("{url} returned {status}")));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| upstream(format!("response parse failed: {e}")))?;
        json.get("carbonIntensity")
            .and_then(serde_json::Value::as_f64)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or_else(|| upstream(String::from("response missing carbonIntensity")))
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    /// Points recorded by this refresh.
    pub recorded: Vec<IntensityPoint>,
    /// Countries whose fetch failed on every attempt.
    pub failed: Vec<CountryCode>,
}

/// Refreshes and serves per-country intensity values.
#[derive(Debug)]
pub struct IntensityTracker {
    source: IntensitySource,
    countries: Vec<CountryCode>,
    attempts: u32,
    retry_delay: Duration,
    retention: TimeDelta,
    current: RwLock<Arc<IntensitySnapshot>>,
}

impl IntensityTracker {
    /// Create a tracker for `countries` with an empty history.
    pub fn new(
        source: IntensitySource,
        countries: Vec<CountryCode>,
        attempts: u32,
        retry_delay: Duration,
        retention: TimeDelta,
    ) -> Self {
        Self {
            source,
            countries,
            attempts: attempts.max(1),
            retry_delay,
            retention,
            current: RwLock::new(Arc::new(IntensitySnapshot::default())),
        }
    }

    /// Tracked countries.
    pub fn countries(&self) -> &[CountryCode] {
        &self.countries
    }

    /// Whether `country` is tracked.
    pub fn tracks(&self, country: &CountryCode) -> bool {
        self.countries.contains(country)
    }

    /// Upstream source name.
    pub const fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<IntensitySnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Intensity for `country` at `at`, falling back to the nearest
    /// earlier hour.
    ///
    /// # Errors
    ///
    /// Returns [`IntensityError::NoIntensityData`] if nothing resolves.
    pub fn intensity_at(
        &self,
        country: &CountryCode,
        at: DateTime<Utc>,
    ) -> Result<f64, IntensityError> {
        self.snapshot().at(country, at)
    }

    /// Latest point per tracked country.
    pub fn latest(&self) -> Vec<IntensityPoint> {
        self.snapshot()
            .latest()
            .into_iter()
            .filter(|p| self.tracks(&p.country))
            .collect()
    }

    /// Merge previously persisted points into the history.
    ///
    /// Points older than the retention window are dropped, except each
    /// country's newest one.
    pub fn restore(&self, points: Vec<IntensityPoint>, now: DateTime<Utc>) -> usize {
        let restored = points.len();
        self.publish(now, points, false);
        tracing::info!(points = restored, "Intensity history restored");
        restored
    }

    /// Fetch every tracked country and publish the result.
    ///
    /// Each country is tried up to the configured number of attempts.
    /// Failures leave that country's previous values in place.
    pub async fn refresh(&self, now: DateTime<Utc>) -> RefreshReport {
        let hour = hour_bucket(now);
        let results = join_all(
            self.countries
                .iter()
                .map(|country| async move { (country, self.fetch_with_retry(country).await) }),
        )
        .await;

        let mut report = RefreshReport::default();
        for (country, result) in results {
            match result {
                Ok(value) => report.recorded.push(IntensityPoint {
                    country: country.clone(),
                    hour,
                    value_g_per_kwh: value,
                }),
                Err(e) => {
                    tracing::warn!(country = %country, error = %e, "Intensity fetch failed, keeping previous value");
                    report.failed.push(country.clone());
                }
            }
        }

        let any_success = !report.recorded.is_empty();
        self.publish(now, report.recorded.clone(), any_success);
        tracing::info!(
            source = self.source.name(),
            recorded = report.recorded.len(),
            failed = report.failed.len(),
            %hour,
            "Intensity refresh complete"
        );
        report
    }

    async fn fetch_with_retry(&self, country: &CountryCode) -> Result<f64, IntensityError> {
        let mut attempt: u32 = 1;
        loop {
            match self.source.fetch(country).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(country = %country, attempt, error = %e, "Intensity fetch retry");
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Build the next snapshot from the current one and swap it in.
    fn publish(&self, now: DateTime<Utc>, points: Vec<IntensityPoint>, refreshed: bool) {
        let cutoff = now
            .checked_sub_signed(self.retention)
            .map_or(DateTime::<Utc>::MIN_UTC, hour_bucket);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = IntensitySnapshot::clone(&guard);
        next.merge(points);
        next.prune(cutoff);
        if refreshed {
            next.refreshed_at = Some(now);
        }
        *guard = Arc::new(next);
    }
}
