//! Error types for the persistent tier.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] error or describes why a backend refused the operation.

/// Errors that can occur in the persistent tier.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backend is temporarily unable to serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
