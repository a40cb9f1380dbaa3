//! Persistent tier for the Ember collector.
//!
//! Closed blocks drained by the flush worker land here, and historical
//! queries read them back. Two backends share one contract:
//!
//! ```text
//! MetricsStore (enum dispatch)
//!     |
//!     +-- Postgres(PostgresStore) --> container_metrics   (TimescaleDB hypertable when available)
//!     |                           --> carbon_intensity    (last-write-wins per country/hour)
//!     |
//!     +-- Memory(MemoryStore)     --> process memory, same semantics
//! ```
//!
//! Writes are idempotent per `(container key, timestamp)` so the flush
//! worker can retry a partially written block without duplicating rows.
//!
//! # Modules
//!
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`metrics_store`] -- Schema bootstrap and SQL for the `PostgreSQL` backend
//! - [`memory`] -- In-process backend with the same contract
//! - [`store`] -- [`MetricsStore`] dispatch enum
//! - [`error`] -- Shared error types

pub mod error;
pub mod memory;
pub mod metrics_store;
pub mod postgres;
pub mod store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use memory::MemoryStore;
pub use metrics_store::{PostgresStore, SchemaReport};
pub use postgres::{PostgresConfig, PostgresPool};
pub use store::MetricsStore;
