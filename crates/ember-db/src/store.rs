//! Backend-agnostic metrics store.
//!
//! Uses enum dispatch instead of trait objects because async methods are
//! not dyn-compatible. Both variants honour the same contract: idempotent
//! per-measurement inserts, half-open range reads, ascending results.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ember_types::{Block, ContainerKey, IntensityPoint, Measurement};

use crate::error::DbError;
use crate::memory::MemoryStore;
use crate::metrics_store::{PostgresStore, SchemaReport};

/// Persistent tier handle.
#[derive(Debug, Clone)]
pub enum MetricsStore {
    /// `PostgreSQL`/`TimescaleDB` backend.
    Postgres(PostgresStore),
    /// In-process backend.
    Memory(Arc<MemoryStore>),
}

impl MetricsStore {
    /// Short backend name for logs and readiness output.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    /// Idempotently create the schema.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the base schema cannot be created.
    pub async fn bootstrap_schema(&self) -> Result<SchemaReport, DbError> {
        match self {
            Self::Postgres(store) => store.bootstrap_schema().await,
            Self::Memory(_) => Ok(SchemaReport { partitioned: false }),
        }
    }

    /// Insert a block, returning the number of new rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails; the caller may retry.
    pub async fn insert_block(&self, block: &Block) -> Result<u64, DbError> {
        match self {
            Self::Postgres(store) => store.insert_block(block).await,
            Self::Memory(store) => store.insert_block(block),
        }
    }

    /// Measurements for `key` with `start <= timestamp < end`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn query_range(
        &self,
        key: &ContainerKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, DbError> {
        match self {
            Self::Postgres(store) => store.query_range(key, start, end).await,
            Self::Memory(store) => Ok(store.query_range(key, start, end)),
        }
    }

    /// The `n` most recent measurements for `key`, optionally strictly
    /// before `before`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn query_last_n(
        &self,
        key: &ContainerKey,
        before: Option<DateTime<Utc>>,
        n: usize,
    ) -> Result<Vec<Measurement>, DbError> {
        match self {
            Self::Postgres(store) => store.query_last_n(key, before, n).await,
            Self::Memory(store) => Ok(store.query_last_n(key, before, n)),
        }
    }

    /// Every key with persisted data.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn list_keys(&self) -> Result<Vec<ContainerKey>, DbError> {
        match self {
            Self::Postgres(store) => store.list_keys().await,
            Self::Memory(store) => Ok(store.list_keys()),
        }
    }

    /// Check connectivity.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the backend is unreachable.
    pub async fn ping(&self) -> Result<(), DbError> {
        match self {
            Self::Postgres(store) => store.ping().await,
            Self::Memory(_) => Ok(()),
        }
    }

    /// Upsert intensity points.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    pub async fn insert_intensities(&self, points: &[IntensityPoint]) -> Result<u64, DbError> {
        match self {
            Self::Postgres(store) => store.insert_intensities(points).await,
            Self::Memory(store) => store.insert_intensities(points),
        }
    }

    /// Intensity points with `hour >= since`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    pub async fn load_intensities(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<IntensityPoint>, DbError> {
        match self {
            Self::Postgres(store) => store.load_intensities(since).await,
            Self::Memory(store) => Ok(store.load_intensities(since)),
        }
    }

    /// Release backend resources.
    pub async fn close(&self) {
        if let Self::Postgres(store) = self {
            store.pool().close().await;
        }
    }
}

impl From<PostgresStore> for MetricsStore {
    fn from(store: PostgresStore) -> Self {
        Self::Postgres(store)
    }
}

impl From<Arc<MemoryStore>> for MetricsStore {
    fn from(store: Arc<MemoryStore>) -> Self {
        Self::Memory(store)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeZone;

    use super::*;

    #[tokio::test]
    async fn memory_variant_dispatches() {
        let memory = Arc::new(MemoryStore::new());
        let store = MetricsStore::from(Arc::clone(&memory));
        assert_eq!(store.kind(), "memory");
        assert!(!store.bootstrap_schema().await.unwrap().partitioned);

        let key = ContainerKey::new("p", "c", "n");
        let start = Utc.timestamp_opt(0, 0).unwrap();
        let end = Utc.timestamp_opt(50, 0).unwrap();
        let block =
            Block::with_measurements(key.clone(), start, end, [Measurement::new(start, 5.0)])
                .unwrap();

        memory.fail_next_writes(1);
        assert!(store.insert_block(&block).await.is_err());
        assert_eq!(store.insert_block(&block).await.unwrap(), 1);
        assert_eq!(store.list_keys().await.unwrap(), vec![key.clone()]);
        assert_eq!(store.query_range(&key, start, end).await.unwrap().len(), 1);
        assert!(store.ping().await.is_ok());
    }
}
