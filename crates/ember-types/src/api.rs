//! Query API request validation and response types.
//!
//! The HTTP body for `POST /api/co2-per-container` is deserialized into
//! [`Co2Request`], which rejects unknown fields, and then converted with
//! [`Co2Request::into_query`] into a fully-typed [`Co2Query`]. Past that
//! boundary the selection is an enum, so "both range and n" or "neither"
//! cannot reach the query engine.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ids::{ContainerKey, CountryCode};

/// Number of measurements served when the body names no selection.
pub const DEFAULT_LAST_N: usize = 5;

/// Largest accepted `n` for last-N queries.
pub const MAX_LAST_N: u64 = 10_000;

/// Accepted naive timestamp layouts, interpreted as UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Raw body of a CO2-per-container query.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Co2Request {
    /// Pod name.
    #[validate(length(min = 1, max = 253))]
    pub pod: String,
    /// Container name.
    #[validate(length(min = 1, max = 253))]
    pub container: String,
    /// Namespace.
    #[validate(length(min = 1, max = 253))]
    pub namespace: String,
    /// Countries to compute emissions for; defaults to the configured one.
    #[serde(default)]
    pub countries: Option<Vec<String>>,
    /// Inclusive range start (RFC 3339, or naive UTC).
    #[serde(default)]
    pub start_time: Option<String>,
    /// Exclusive range end (RFC 3339, or naive UTC).
    #[serde(default)]
    pub end_time: Option<String>,
    /// Number of most recent measurements.
    #[serde(default)]
    #[validate(range(min = 1, max = 10_000))]
    pub n: Option<u64>,
}

/// Which measurements a query selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Measurements with `start <= timestamp < end`.
    Range {
        /// Inclusive start.
        start: DateTime<Utc>,
        /// Exclusive end.
        end: DateTime<Utc>,
    },
    /// The `n` most recent measurements.
    LastN(NonZeroUsize),
}

impl Selection {
    /// The reported mode for this selection.
    pub const fn mode(&self) -> SelectionMode {
        match self {
            Self::Range { .. } => SelectionMode::Range,
            Self::LastN(_) => SelectionMode::LastN,
        }
    }
}

/// A validated CO2 query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Co2Query {
    /// Container to query.
    pub key: ContainerKey,
    /// Countries in request order, without duplicates. Never empty.
    pub countries: Vec<CountryCode>,
    /// Range or last-N selection.
    pub selection: Selection,
}

/// A request that failed validation.
///
/// Every variant maps to a stable, machine-readable [`reason`](Self::reason).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The body is not valid JSON for this endpoint.
    #[error("malformed request body: {0}")]
    Malformed(String),

    /// A field violates its length or range constraint.
    #[error("invalid value for field `{0}`")]
    InvalidField(String),

    /// Range fields and `n` were supplied together.
    #[error("supply either start_time/end_time or n, not both")]
    ContradictorySelection,

    /// Only one of `start_time` / `end_time` was supplied.
    #[error("start_time and end_time must be provided together")]
    IncompleteRange,

    /// A timestamp could not be parsed.
    #[error("invalid timestamp in `{field}`: {value:?} (use RFC 3339)")]
    InvalidTimestamp {
        /// The offending field.
        field: &'static str,
        /// The raw value.
        value: String,
    },

    /// `start_time` is after `end_time`.
    #[error("start_time must not be after end_time")]
    InvertedRange,

    /// `n` is not a positive integer within bounds.
    #[error("n must be an integer between 1 and {MAX_LAST_N}")]
    InvalidN,

    /// `countries` was given but empty.
    #[error("countries must be a non-empty list of country codes")]
    EmptyCountries,

    /// A country entry is not a two-letter code.
    #[error("invalid country code {0:?}")]
    InvalidCountry(String),

    /// A country code is well-formed but not tracked.
    #[error("unsupported country code {0}")]
    UnsupportedCountry(String),
}

impl RequestError {
    /// Stable machine-readable reason code.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_body",
            Self::InvalidField(_) => "invalid_field",
            Self::ContradictorySelection => "contradictory_selection",
            Self::IncompleteRange => "incomplete_range",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
            Self::InvertedRange => "inverted_range",
            Self::InvalidN => "invalid_n",
            Self::EmptyCountries => "empty_countries",
            Self::InvalidCountry(_) => "invalid_country",
            Self::UnsupportedCountry(_) => "unsupported_country",
        }
    }
}

impl Co2Request {
    /// Parse a raw JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Malformed`] for invalid JSON, missing
    /// required fields, wrong types, or unknown fields.
    pub fn from_json(body: &[u8]) -> Result<Self, RequestError> {
        serde_json::from_slice(body).map_err(|e| RequestError::Malformed(e.to_string()))
    }

    /// Validate the request into a typed [`Co2Query`].
    ///
    /// `default_country` is used when `countries` is absent. Whether the
    /// countries are actually tracked is checked later, against the
    /// intensity tracker.
    ///
    /// # Errors
    ///
    /// Returns the first [`RequestError`] found.
    pub fn into_query(self, default_country: &CountryCode) -> Result<Co2Query, RequestError> {
        if let Err(errors) = self.validate() {
            let field = errors
                .field_errors()
                .into_keys()
                .min()
                .map(|f| f.to_string())
                .unwrap_or_default();
            return Err(if field == "n" {
                RequestError::InvalidN
            } else {
                RequestError::InvalidField(field)
            });
        }

        let selection = match (self.start_time, self.end_time, self.n) {
            (Some(_), _, Some(_)) | (_, Some(_), Some(_)) => {
                return Err(RequestError::ContradictorySelection);
            }
            (Some(start), Some(end), None) => {
                let start = parse_timestamp("start_time", &start)?;
                let end = parse_timestamp("end_time", &end)?;
                if start > end {
                    return Err(RequestError::InvertedRange);
                }
                Selection::Range { start, end }
            }
            (Some(_), None, None) | (None, Some(_), None) => {
                return Err(RequestError::IncompleteRange);
            }
            (None, None, n) => {
                let n = match n {
                    Some(n) => usize::try_from(n).map_err(|_| RequestError::InvalidN)?,
                    None => DEFAULT_LAST_N,
                };
                Selection::LastN(NonZeroUsize::new(n).ok_or(RequestError::InvalidN)?)
            }
        };

        let countries = match self.countries {
            None => vec![default_country.clone()],
            Some(raw) if raw.is_empty() => return Err(RequestError::EmptyCountries),
            Some(raw) => {
                let mut parsed: Vec<CountryCode> = Vec::with_capacity(raw.len());
                for entry in raw {
                    let code = CountryCode::parse(&entry)
                        .map_err(|_| RequestError::InvalidCountry(entry.clone()))?;
                    if !parsed.contains(&code) {
                        parsed.push(code);
                    }
                }
                parsed
            }
        };

        Ok(Co2Query {
            key: ContainerKey::new(self.pod, self.container, self.namespace),
            countries,
            selection,
        })
    }
}

/// Parse an RFC 3339 timestamp, or a naive one read as UTC.
fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>, RequestError> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| RequestError::InvalidTimestamp {
            field,
            value: raw.to_owned(),
        })
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Selection mode reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// `[start_time, end_time)` selection.
    Range,
    /// Most recent `n` measurements.
    LastN,
}

/// Whether any data was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// At least one measurement was served.
    Ok,
    /// No measurements exist for the key and selection.
    NoData,
}

/// Emission figures for one measurement in one country.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountryEmission {
    /// Intensity applied, if one could be resolved.
    pub intensity_g_per_kwh: Option<f64>,
    /// Emission rate in grams of CO2 per second.
    pub co2_gps: Option<f64>,
    /// Grams of CO2 over the sample interval.
    pub co2_g: Option<f64>,
}

/// One served measurement with its emission figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementReport {
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
    /// Power draw in watts.
    pub joules_per_second: f64,
    /// Energy over the sample interval (rectangle rule).
    pub energy_j: f64,
    /// Emission rate for the primary country.
    pub co2_gps: Option<f64>,
    /// Emission for the primary country.
    pub co2_g: Option<f64>,
    /// Intensity applied for the primary country.
    pub intensity_g_per_kwh: Option<f64>,
    /// Figures for every requested country.
    pub per_country: BTreeMap<CountryCode, CountryEmission>,
}

/// Totals for one requested country.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryTotals {
    /// Total grams of CO2, or `None` when some intensity was missing.
    pub co2_g: Option<f64>,
    /// Total energy in joules.
    pub energy_j: f64,
    /// Measurements for which no intensity could be resolved.
    pub missing_intensity: usize,
    /// `no_intensity_data` when `co2_g` is withheld.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// Response of a CO2-per-container query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Co2Response {
    /// Pod name.
    pub pod: String,
    /// Container name.
    pub container: String,
    /// Namespace.
    pub namespace: String,
    /// `ok`, or `no_data` for an empty result.
    pub status: QueryStatus,
    /// Mode the query was served in.
    pub selection_mode: SelectionMode,
    /// Number of measurements served.
    pub measurement_count: usize,
    /// Resolved inclusive start.
    pub resolved_start: Option<DateTime<Utc>>,
    /// Resolved end (exclusive for ranges, last served sample for last-N).
    pub resolved_end: Option<DateTime<Utc>>,
    /// Country whose figures fill the flat measurement fields.
    pub primary_country: CountryCode,
    /// Interval used for energy integration.
    pub sample_interval_seconds: f64,
    /// Set when persisted data could not be read and only buffered data
    /// was served.
    pub persistence_degraded: bool,
    /// Totals per requested country.
    pub per_country: BTreeMap<CountryCode, CountryTotals>,
    /// Served measurements in ascending time order.
    pub measurements: Vec<MeasurementReport>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn de() -> CountryCode {
        CountryCode::parse("DE").unwrap()
    }

    fn request(json: &str) -> Result<Co2Query, RequestError> {
        Co2Request::from_json(json.as_bytes())?.into_query(&de())
    }

    #[test]
    fn defaults_to_last_five_in_default_country() {
        let query = request(r#"{"pod":"p","container":"c","namespace":"n"}"#).unwrap();
        assert_eq!(query.countries, vec![de()]);
        assert_eq!(
            query.selection,
            Selection::LastN(NonZeroUsize::new(DEFAULT_LAST_N).unwrap())
        );
    }

    #[test]
    fn range_and_n_together_is_contradictory() {
        let err = request(
            r#"{"pod":"p","container":"c","namespace":"n","n":3,
                "start_time":"2024-01-01T00:00:00Z","end_time":"2024-01-01T01:00:00Z"}"#,
        )
        .unwrap_err();
        assert_eq!(err, RequestError::ContradictorySelection);
        assert_eq!(err.reason(), "contradictory_selection");
    }

    #[test]
    fn half_a_range_is_rejected() {
        let err = request(
            r#"{"pod":"p","container":"c","namespace":"n","start_time":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap_err();
        assert_eq!(err, RequestError::IncompleteRange);
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let query = request(
            r#"{"pod":"p","container":"c","namespace":"n",
                "start_time":"2024-01-01T00:00:00","end_time":"2024-01-01T02:00:00+01:00"}"#,
        )
        .unwrap();
        let Selection::Range { start, end } = query.selection else {
            panic!("expected range selection");
        };
        assert_eq!(start.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-01-01T01:00:00+00:00");
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = request(
            r#"{"pod":"p","container":"c","namespace":"n",
                "start_time":"2024-01-02T00:00:00Z","end_time":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap_err();
        assert_eq!(err, RequestError::InvertedRange);
    }

    #[test]
    fn zero_n_is_rejected() {
        let err = request(r#"{"pod":"p","container":"c","namespace":"n","n":0}"#).unwrap_err();
        assert_eq!(err, RequestError::InvalidN);
    }

    #[test]
    fn empty_pod_is_an_invalid_field() {
        let err = request(r#"{"pod":"","container":"c","namespace":"n"}"#).unwrap_err();
        assert_eq!(err, RequestError::InvalidField(String::from("pod")));
    }

    #[test]
    fn unknown_fields_are_malformed() {
        let err = request(r#"{"pod":"p","container":"c","namespace":"n","limit":3}"#).unwrap_err();
        assert_eq!(err.reason(), "malformed_body");
    }

    #[test]
    fn countries_are_normalised_and_deduplicated() {
        let query = request(
            r#"{"pod":"p","container":"c","namespace":"n","countries":["fr","DE","FR"]}"#,
        )
        .unwrap();
        let codes: Vec<_> = query.countries.iter().map(CountryCode::as_str).collect();
        assert_eq!(codes, vec!["FR", "DE"]);
    }

    #[test]
    fn empty_and_invalid_countries_are_rejected() {
        let empty = request(r#"{"pod":"p","container":"c","namespace":"n","countries":[]}"#);
        assert_eq!(empty.unwrap_err(), RequestError::EmptyCountries);

        let invalid =
            request(r#"{"pod":"p","container":"c","namespace":"n","countries":["Germany"]}"#);
        assert_eq!(
            invalid.unwrap_err(),
            RequestError::InvalidCountry(String::from("Germany"))
        );
    }
}
