//! Telemetry pipeline for the Ember CO2 collector.
//!
//! Power readings flow from an exporter through a rate-deriving sampler
//! into epoch-aligned blocks held in an in-memory buffer. Closed blocks
//! are drained to the persistent tier by a background flush worker.
//! Carbon intensity is refreshed on its own schedule, and the query
//! engine stitches buffered and persisted data into emission figures.
//!
//! # Architecture
//!
//! ```text
//! ExporterSource --> Sampler --> BlockBuilder --> BufferStore --(evict)--> gone
//!                                     |
//!                                     +--> FlushQueue --> FlushWorker --> MetricsStore
//!
//! IntensitySource --> IntensityTracker (own loop)
//!
//! QueryEngine <-- BufferStore snapshot + MetricsStore + IntensityTracker
//! ```
//!
//! [`Pipeline`] owns all of it and runs the sampler, intensity, and flush
//! loops as independent tasks.
//!
//! # Modules
//!
//! - [`config`] -- Layered collector configuration
//! - [`exporter`] -- Exporter snapshot sources (Kepler, scripted)
//! - [`sampler`] -- Rate derivation from exporter snapshots
//! - [`buffer`] -- Per-key in-memory block store
//! - [`block`] -- Block closing and appending on each tick
//! - [`flush`] -- Bounded flush queue and retrying worker
//! - [`intensity`] -- Carbon-intensity cache and sources
//! - [`query`] -- Range and last-N emission queries
//! - [`health`] -- Sampler health and readiness reports
//! - [`pipeline`] -- Lifecycle of the background loops
//! - [`error`] -- Shared error types

pub mod block;
pub mod buffer;
pub mod config;
pub mod error;
pub mod exporter;
pub mod flush;
pub mod health;
pub mod intensity;
pub mod pipeline;
pub mod query;
pub mod sampler;

// Re-export primary types for convenience.
pub use block::BlockBuilder;
pub use buffer::{BufferStore, SeriesSnapshot};
pub use config::{CollectorConfig, ConfigError};
pub use error::{ExporterError, IntensityError, PipelineError, QueryError};
pub use exporter::{
    ExporterSnapshot, ExporterSource, KeplerExporter, Reading, ReadingUnit, ScriptedExporter,
};
pub use flush::{FlushQueue, FlushStats, FlushStatsSnapshot, FlushWorker, RetryPolicy, flush_channel};
pub use health::{HealthState, Readiness};
pub use intensity::{
    ElectricityMapsSource, IntensitySnapshot, IntensitySource, IntensityTracker, RefreshReport,
};
pub use pipeline::{Pipeline, SampleReport};
pub use query::QueryEngine;
pub use sampler::Sampler;
