//! Error types for the collector binary.
//!
//! [`CollectorError`] wraps every failure that can abort startup. Once the
//! pipeline runs, subsystem failures are contained and logged instead.

/// Top-level startup error.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ember_core::ConfigError,
    },

    /// The persistent store could not be reached or prepared.
    #[error("store error: {source}")]
    Store {
        /// The underlying database error.
        #[from]
        source: ember_db::DbError,
    },

    /// The exporter client could not be created.
    #[error("exporter error: {source}")]
    Exporter {
        /// The underlying exporter error.
        #[from]
        source: ember_core::ExporterError,
    },

    /// The intensity source could not be created.
    #[error("intensity source error: {message}")]
    Intensity {
        /// Description of the failure.
        message: String,
    },

    /// The pipeline could not be built or started.
    #[error("pipeline error: {source}")]
    Pipeline {
        /// The underlying pipeline error.
        #[from]
        source: ember_core::PipelineError,
    },

    /// The API server failed to bind or serve.
    #[error("server error: {source}")]
    Server {
        /// The underlying server error.
        #[from]
        source: ember_api::ServerError,
    },
}
