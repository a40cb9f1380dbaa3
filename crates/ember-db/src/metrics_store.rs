//! `PostgreSQL` backend for container metrics and carbon intensity.
//!
//! Each measurement is one row in `container_metrics`, keyed by
//! `(pod_id, container_name, namespace, time)`. The unique lookup index is
//! also the conflict target, so re-inserting a block is a no-op. When the
//! `TimescaleDB` extension is available the table is turned into a
//! hypertable partitioned on `time`; otherwise the plain table is used.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ember_types::{Block, ContainerKey, CountryCode, IntensityPoint, Measurement};

use crate::error::DbError;
use crate::postgres::PostgresPool;

const CREATE_METRICS_TABLE: &str = r"CREATE TABLE IF NOT EXISTS container_metrics (
    time              TIMESTAMPTZ      NOT NULL,
    pod_id            TEXT             NOT NULL,
    container_name    TEXT             NOT NULL,
    namespace         TEXT             NOT NULL,
    joules_per_second DOUBLE PRECISION NOT NULL
)";

const CREATE_METRICS_INDEX: &str = r"CREATE UNIQUE INDEX IF NOT EXISTS container_metrics_lookup_idx
    ON container_metrics (pod_id, container_name, namespace, time DESC)";

const CREATE_INTENSITY_TABLE: &str = r"CREATE TABLE IF NOT EXISTS carbon_intensity (
    country         TEXT             NOT NULL,
    hour            TIMESTAMPTZ      NOT NULL,
    value_g_per_kwh DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (country, hour)
)";

/// Outcome of schema bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaReport {
    /// Whether `container_metrics` is a time-partitioned hypertable.
    pub partitioned: bool,
}

/// A `(time, joules_per_second)` row from `container_metrics`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MetricRow {
    /// Sample timestamp.
    pub time: DateTime<Utc>,
    /// Power draw in watts.
    pub joules_per_second: f64,
}

impl From<MetricRow> for Measurement {
    fn from(row: MetricRow) -> Self {
        Self::new(row.time, row.joules_per_second)
    }
}

/// A distinct container identity from `container_metrics`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyRow {
    /// Pod name.
    pub pod_id: String,
    /// Container name.
    pub container_name: String,
    /// Namespace.
    pub namespace: String,
}

/// A row from `carbon_intensity`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IntensityRow {
    /// ISO country code as stored.
    pub country: String,
    /// Start of the UTC hour.
    pub hour: DateTime<Utc>,
    /// Grams of CO2 per kilowatt-hour.
    pub value_g_per_kwh: f64,
}

/// Metrics operations against `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PostgresPool,
}

impl PostgresStore {
    /// Create a store over an existing pool.
    pub const fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &PostgresPool {
        &self.pool
    }

    /// Create tables and the lookup index if absent, then try to convert
    /// `container_metrics` into a hypertable.
    ///
    /// Missing `TimescaleDB` is not an error: the plain table is kept and
    /// the report says so.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the tables or index cannot be
    /// created.
    pub async fn bootstrap_schema(&self) -> Result<SchemaReport, DbError> {
        let pool = self.pool.pool();
        sqlx::query(CREATE_METRICS_TABLE).execute(pool).await?;
        sqlx::query(CREATE_METRICS_INDEX).execute(pool).await?;
        sqlx::query(CREATE_INTENSITY_TABLE).execute(pool).await?;

        if let Err(e) = sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb")
            .execute(pool)
            .await
        {
            tracing::warn!(error = %e, "TimescaleDB unavailable, using plain table");
            return Ok(SchemaReport { partitioned: false });
        }

        let hypertable = sqlx::query(
            r"SELECT create_hypertable('container_metrics', 'time',
                  if_not_exists => TRUE, migrate_data => TRUE)",
        )
        .execute(pool)
        .await;

        match hypertable {
            Ok(_) => {
                tracing::info!("container_metrics is a TimescaleDB hypertable");
                Ok(SchemaReport { partitioned: true })
            }
            Err(e) => {
                tracing::warn!(error = %e, "Hypertable conversion failed, using plain table");
                Ok(SchemaReport { partitioned: false })
            }
        }
    }

    /// Insert every measurement of a block, ignoring rows that already exist.
    ///
    /// Runs as one UNNEST insert inside a transaction. Returns the number
    /// of rows actually inserted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn insert_block(&self, block: &Block) -> Result<u64, DbError> {
        if block.is_empty() {
            return Ok(0);
        }

        let (times, rates): (Vec<DateTime<Utc>>, Vec<f64>) = block
            .measurements()
            .iter()
            .map(|m| (m.timestamp, m.joules_per_second))
            .unzip();
        let key = block.key();

        let mut tx = self.pool.pool().begin().await?;
        let result = sqlx::query(
            r"INSERT INTO container_metrics (time, pod_id, container_name, namespace, joules_per_second)
              SELECT t, $3, $4, $5, j FROM UNNEST($1::TIMESTAMPTZ[], $2::DOUBLE PRECISION[]) AS u(t, j)
              ON CONFLICT (pod_id, container_name, namespace, time) DO NOTHING",
        )
        .bind(&times)
        .bind(&rates)
        .bind(&key.pod)
        .bind(&key.container)
        .bind(&key.namespace)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(
            key = %key,
            rows = result.rows_affected(),
            submitted = times.len(),
            "Inserted block (batch UNNEST)"
        );
        Ok(result.rows_affected())
    }

    /// Measurements for `key` with `start <= time < end`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn query_range(
        &self,
        key: &ContainerKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, DbError> {
        let rows = sqlx::query_as::<_, MetricRow>(
            r"SELECT time, joules_per_second
              FROM container_metrics
              WHERE pod_id = $1 AND container_name = $2 AND namespace = $3
                AND time >= $4 AND time < $5
              ORDER BY time",
        )
        .bind(&key.pod)
        .bind(&key.container)
        .bind(&key.namespace)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool.pool())
        .await?;

        Ok(rows.into_iter().map(Measurement::from).collect())
    }

    /// The `n` most recent measurements for `key` strictly before `before`
    /// (or overall when `None`), ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn query_last_n(
        &self,
        key: &ContainerKey,
        before: Option<DateTime<Utc>>,
        n: usize,
    ) -> Result<Vec<Measurement>, DbError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, MetricRow>(
            r"SELECT time, joules_per_second
              FROM container_metrics
              WHERE pod_id = $1 AND container_name = $2 AND namespace = $3
                AND ($4::TIMESTAMPTZ IS NULL OR time < $4)
              ORDER BY time DESC
              LIMIT $5",
        )
        .bind(&key.pod)
        .bind(&key.container)
        .bind(&key.namespace)
        .bind(before)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await?;

        Ok(rows.into_iter().rev().map(Measurement::from).collect())
    }

    /// Every distinct container key that has persisted rows.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_keys(&self) -> Result<Vec<ContainerKey>, DbError> {
        let rows = sqlx::query_as::<_, KeyRow>(
            r"SELECT DISTINCT pod_id, container_name, namespace
              FROM container_metrics
              ORDER BY pod_id, container_name, namespace",
        )
        .fetch_all(self.pool.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ContainerKey::new(r.pod_id, r.container_name, r.namespace))
            .collect())
    }

    /// Round-trip a trivial query.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the database is unreachable.
    pub async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(self.pool.pool()).await?;
        Ok(())
    }

    /// Upsert intensity points; a later value for the same country and
    /// hour replaces the earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn insert_intensities(&self, points: &[IntensityPoint]) -> Result<u64, DbError> {
        // ON CONFLICT DO UPDATE cannot touch one row twice per statement.
        let latest: BTreeMap<(&str, DateTime<Utc>), f64> = points
            .iter()
            .map(|p| ((p.country.as_str(), p.hour), p.value_g_per_kwh))
            .collect();
        if latest.is_empty() {
            return Ok(0);
        }

        let mut countries = Vec::with_capacity(latest.len());
        let mut hours = Vec::with_capacity(latest.len());
        let mut values = Vec::with_capacity(latest.len());
        for ((country, hour), value) in latest {
            countries.push(country.to_owned());
            hours.push(hour);
            values.push(value);
        }

        let result = sqlx::query(
            r"INSERT INTO carbon_intensity (country, hour, value_g_per_kwh)
              SELECT * FROM UNNEST($1::TEXT[], $2::TIMESTAMPTZ[], $3::DOUBLE PRECISION[])
              ON CONFLICT (country, hour) DO UPDATE SET value_g_per_kwh = EXCLUDED.value_g_per_kwh",
        )
        .bind(&countries)
        .bind(&hours)
        .bind(&values)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Intensity points with `hour >= since`, ordered by country and hour.
    ///
    /// Rows with an unparseable country code are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn load_intensities(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<IntensityPoint>, DbError> {
        let rows = sqlx::query_as::<_, IntensityRow>(
            r"SELECT country, hour, value_g_per_kwh
              FROM carbon_intensity
              WHERE hour >= $1
              ORDER BY country, hour",
        )
        .bind(since)
        .fetch_all(self.pool.pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match CountryCode::parse(&row.country) {
                Ok(country) => Some(IntensityPoint {
                    country,
                    hour: row.hour,
                    value_g_per_kwh: row.value_g_per_kwh,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping stored intensity row");
                    None
                }
            })
            .collect())
    }
}
