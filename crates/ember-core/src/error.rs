//! Error types for the telemetry pipeline.
//!
//! Background loops contain their own failures: exporter and intensity
//! errors degrade one subsystem and are logged. Only [`QueryError`]
//! reaches request handlers.

use chrono::{DateTime, Utc};
use ember_db::DbError;
use ember_types::{CountryCode, GridError, RequestError};

/// The exporter could not produce a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ExporterError {
    /// The exporter could not be reached or answered with an error status.
    #[error("exporter unavailable: {0}")]
    Unavailable(String),

    /// The exporter answered with a body that could not be read.
    #[error("exporter response unreadable: {0}")]
    Parse(String),
}

/// Carbon-intensity lookup or refresh failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntensityError {
    /// No value is known for the hour or any earlier hour.
    #[error("no intensity data for {country} at or before {at}")]
    NoIntensityData {
        /// Country looked up.
        country: CountryCode,
        /// Timestamp looked up.
        at: DateTime<Utc>,
    },

    /// The upstream source failed for a country.
    #[error("intensity source failed for {country}: {message}")]
    Upstream {
        /// Country being fetched.
        country: CountryCode,
        /// Failure description.
        message: String,
    },
}

impl IntensityError {
    /// Stable kind string reported in query responses.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NoIntensityData { .. } => "no_intensity_data",
            Self::Upstream { .. } => "upstream_unavailable",
        }
    }
}

/// Failures surfaced to query callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The query is malformed or names an untracked country.
    #[error(transparent)]
    Validation(#[from] RequestError),
}

/// Failures building or running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The configuration cannot be turned into a running pipeline.
    #[error("pipeline configuration error: {0}")]
    Config(String),

    /// The block grid is invalid.
    #[error(transparent)]
    Grid(#[from] GridError),

    /// The persistent store failed during setup.
    #[error(transparent)]
    Store(#[from] DbError),

    /// `start` was called on a running or stopped pipeline.
    #[error("pipeline already started")]
    AlreadyStarted,
}
