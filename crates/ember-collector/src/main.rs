//! Collector binary for Ember.
//!
//! Wires the exporter, the telemetry pipeline, the optional persistent
//! store, and the query API together, then runs until Ctrl-C or SIGTERM.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (`EMBER_CONFIG`, default `ember.yaml`, plus env)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and bootstrap the schema, if persistence is on
//! 4. Build the exporter client and the intensity source
//! 5. Build the pipeline and restore persisted intensity history
//! 6. Poll the exporter once as a self-check (failure only warns)
//! 7. Start the sampler, intensity, and flush loops
//! 8. Serve the query API until a shutdown signal arrives
//! 9. Stop the pipeline (final flush) and close the store

mod error;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use ember_api::{AppState, ServerConfig, start_server};
use ember_core::config::{IntensityConfig, IntensitySourceKind, LoggingConfig};
use ember_core::{
    CollectorConfig, ElectricityMapsSource, ExporterSource, IntensitySource, KeplerExporter,
    Pipeline,
};
use ember_db::{MetricsStore, PostgresConfig, PostgresPool, PostgresStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::CollectorError;

/// Config file read when `EMBER_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "ember.yaml";

/// HTTP timeout for carbon-intensity API calls.
const INTENSITY_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any startup step fails or the server cannot bind.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load configuration.
    let config_path = std::env::var("EMBER_CONFIG")
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = CollectorConfig::load(Some(&config_path))
        .map_err(CollectorError::from)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!(
        config = %config_path.display(),
        exporter_url = %config.sampler.exporter_url,
        interval_secs = config.sampler.interval_secs,
        block_secs = config.blocks.duration_secs,
        persistence = config.persistence.enabled,
        "ember-collector starting"
    );

    // 3. Persistent store.
    let store = connect_store(&config)
        .await
        .context("preparing persistent store")?;

    // 4. Exporter and intensity source.
    let exporter = KeplerExporter::new(
        &config.sampler.exporter_url,
        config.sampler.exporter_timeout(),
    )
    .map_err(CollectorError::from)?;
    let intensity_source = build_intensity_source(&config.intensity)?;

    // 5. Pipeline.
    let pipeline = Pipeline::build(
        &config,
        ExporterSource::Kepler(exporter),
        intensity_source,
        store.clone(),
    )
    .map_err(CollectorError::from)?;
    let restored = pipeline.restore_intensity(Utc::now()).await;
    info!(points = restored, "Intensity history loaded");

    // 6. Exporter self-check.
    match pipeline.check_exporter().await {
        Ok(containers) => info!(containers, "Exporter reachable"),
        Err(e) => warn!(error = %e, "Exporter self-check failed; sampler will keep retrying"),
    }

    // 7. Background loops.
    pipeline.start().map_err(CollectorError::from)?;

    // 8. Query API.
    let server_config = ServerConfig {
        host: config.server.host.clone(),
        port: config.server.port,
    };
    let state = Arc::new(AppState::new(Arc::clone(&pipeline)));
    let served = start_server(&server_config, state, shutdown_signal()).await;

    // 9. Shutdown, even when the server failed.
    pipeline.stop().await;
    if let Some(store) = store {
        store.close().await;
    }
    served.map_err(CollectorError::from)?;

    info!("ember-collector shutdown complete");
    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Connect and bootstrap the store when persistence is enabled.
async fn connect_store(config: &CollectorConfig) -> Result<Option<MetricsStore>, CollectorError> {
    if !config.persistence.enabled {
        info!("Persistence disabled; serving from the in-memory buffer only");
        return Ok(None);
    }
    let Some(url) = config.persistence.database_url.as_deref() else {
        return Err(ember_core::ConfigError::Invalid(String::from(
            "persistence.enabled requires persistence.database_url",
        ))
        .into());
    };

    let pg_config =
        PostgresConfig::new(url).with_max_connections(config.persistence.max_connections);
    let pool = PostgresPool::connect(&pg_config).await?;
    let store = MetricsStore::from(PostgresStore::new(pool));
    let schema = store.bootstrap_schema().await?;
    info!(partitioned = schema.partitioned, "Metrics schema ready");
    Ok(Some(store))
}

fn build_intensity_source(config: &IntensityConfig) -> Result<IntensitySource, CollectorError> {
    match config.source {
        IntensitySourceKind::Static => Ok(IntensitySource::Static(config.static_table()?)),
        IntensitySourceKind::ElectricityMaps => ElectricityMapsSource::new(
            &config.api_url,
            config.api_token.clone(),
            INTENSITY_HTTP_TIMEOUT,
        )
        .map(IntensitySource::ElectricityMaps)
        .map_err(|message| CollectorError::Intensity { message }),
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl-C received, shutting down"),
        () = terminate => info!("SIGTERM received, shutting down"),
    }
}
