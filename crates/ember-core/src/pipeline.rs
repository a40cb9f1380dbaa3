//! Lifecycle of the background loops.
//!
//! A [`Pipeline`] owns the buffer, the intensity tracker, the query engine,
//! and, when persistence is enabled, the flush queue. [`Pipeline::start`]
//! spawns three independent tasks:
//!
//! - the sampler loop, which polls the exporter every sample interval and
//!   feeds the block builder;
//! - the intensity loop, which refreshes carbon intensity on its own
//!   schedule and persists recorded points;
//! - the flush worker, which drains closed blocks to the store.
//!
//! A slow intensity source never delays sampling, and a slow store never
//! delays either.
//!
//! [`Pipeline::stop`] signals the loops, closes every open block, and
//! gives the flush worker a bounded time to drain.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use ember_db::MetricsStore;
use ember_types::{Block, Co2Query, Co2Response, ContainerKey, CountryCode, Measurement};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::block::BlockBuilder;
use crate::buffer::BufferStore;
use crate::config::CollectorConfig;
use crate::error::{ExporterError, PipelineError, QueryError};
use crate::exporter::ExporterSource;
use crate::flush::{FlushQueue, FlushStats, FlushWorker, RetryPolicy, flush_channel};
use crate::health::{HealthState, Readiness, staleness_threshold};
use crate::intensity::{IntensitySource, IntensityTracker, RefreshReport};
use crate::query::QueryEngine;
use crate::sampler::Sampler;

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug)]
struct Runtime {
    lifecycle: Lifecycle,
    stop_tx: watch::Sender<bool>,
    worker: Option<FlushWorker>,
    sampler_task: Option<JoinHandle<()>>,
    intensity_task: Option<JoinHandle<()>>,
    flush_task: Option<JoinHandle<()>>,
}

/// Outcome of one sampler poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleReport {
    /// Measurements derived from the snapshot.
    pub measurements: usize,
    /// Blocks closed during the tick.
    pub closed_blocks: usize,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The running collector: sampler, blocks, buffer, flush, intensity, and
/// queries.
#[derive(Debug)]
pub struct Pipeline {
    buffer: Arc<BufferStore>,
    builder: BlockBuilder,
    sampler: Mutex<Sampler>,
    exporter: ExporterSource,
    intensity: Arc<IntensityTracker>,
    query: QueryEngine,
    store: Option<MetricsStore>,
    health: HealthState,
    queue: Mutex<Option<FlushQueue>>,
    flush_stats: Option<Arc<FlushStats>>,
    runtime: Mutex<Runtime>,
    default_country: CountryCode,
    sample_interval: Duration,
    sample_interval_secs: u64,
    refresh_interval: Duration,
    intensity_retention: TimeDelta,
    request_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Wire up a pipeline from validated configuration.
    ///
    /// `store` must be provided exactly when persistence is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the configuration is invalid or
    /// persistence is enabled without a store.
    pub fn build(
        config: &CollectorConfig,
        exporter: ExporterSource,
        intensity_source: IntensitySource,
        store: Option<MetricsStore>,
    ) -> Result<Arc<Self>, PipelineError> {
        let config_error = |e: crate::config::ConfigError| PipelineError::Config(e.to_string());
        config.validate().map_err(config_error)?;
        let grid = config.blocks.grid().map_err(config_error)?;
        let horizon = config.blocks.retention().map_err(config_error)?;
        let countries = config.intensity.tracked_countries().map_err(config_error)?;
        let default_country = config.intensity.default_country().map_err(config_error)?;

        let store = match (config.persistence.enabled, store) {
            (true, None) => {
                return Err(PipelineError::Config(String::from(
                    "persistence is enabled but no store was provided",
                )));
            }
            (false, Some(_)) => {
                tracing::warn!("Store provided with persistence disabled; ignoring it");
                None
            }
            (_, store) => store,
        };

        let buffer = Arc::new(BufferStore::new(grid, horizon));
        let intensity = Arc::new(IntensityTracker::new(
            intensity_source,
            countries,
            config.intensity.fetch_attempts,
            config.intensity.retry_delay(),
            config.intensity.history_retention(),
        ));

        let (queue, worker) = match &store {
            Some(store) => {
                let policy = RetryPolicy {
                    max_attempts: config.persistence.max_attempts,
                    base_delay: Duration::from_millis(config.persistence.backoff_base_ms),
                    max_delay: Duration::from_millis(config.persistence.backoff_max_ms),
                };
                let (queue, worker) =
                    flush_channel(config.persistence.queue_capacity, store.clone(), policy);
                (Some(queue), Some(worker))
            }
            None => (None, None),
        };
        let flush_stats = queue.as_ref().map(FlushQueue::stats);

        let query = QueryEngine::new(
            Arc::clone(&buffer),
            store.clone(),
            Arc::clone(&intensity),
            config.sampler.interval(),
            config.server.request_timeout(),
        );

        let (stop_tx, _) = watch::channel(false);

        tracing::info!(
            exporter = exporter.name(),
            intensity_source = intensity.source_name(),
            store = store.as_ref().map_or("none", MetricsStore::kind),
            block_secs = config.blocks.duration_secs,
            interval_secs = config.sampler.interval_secs,
            countries = intensity.countries().len(),
            "Pipeline built"
        );

        Ok(Arc::new(Self {
            builder: BlockBuilder::new(Arc::clone(&buffer)),
            buffer,
            sampler: Mutex::new(Sampler::new()),
            exporter,
            intensity,
            query,
            store,
            health: HealthState::new(),
            queue: Mutex::new(queue),
            flush_stats,
            runtime: Mutex::new(Runtime {
                lifecycle: Lifecycle::Idle,
                stop_tx,
                worker,
                sampler_task: None,
                intensity_task: None,
                flush_task: None,
            }),
            default_country,
            sample_interval: config.sampler.interval(),
            sample_interval_secs: config.sampler.interval_secs,
            refresh_interval: config.intensity.refresh_interval(),
            intensity_retention: config.intensity.history_retention(),
            request_timeout: config.server.request_timeout(),
            shutdown_timeout: config.persistence.shutdown_timeout(),
        }))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The in-memory buffer.
    pub const fn buffer(&self) -> &Arc<BufferStore> {
        &self.buffer
    }

    /// The intensity tracker.
    pub const fn intensity(&self) -> &Arc<IntensityTracker> {
        &self.intensity
    }

    /// Sampler health.
    pub const fn health(&self) -> &HealthState {
        &self.health
    }

    /// Flush counters, when persistence is enabled.
    pub fn flush_stats(&self) -> Option<Arc<FlushStats>> {
        self.flush_stats.clone()
    }

    /// Country used when a request names none.
    pub const fn default_country(&self) -> &CountryCode {
        &self.default_country
    }

    /// Sampling interval.
    pub const fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    /// Bound on store calls made on behalf of a request.
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the sampler, intensity, and flush tasks.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AlreadyStarted`] on a second call.
    pub fn start(self: &Arc<Self>) -> Result<(), PipelineError> {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if runtime.lifecycle != Lifecycle::Idle {
            return Err(PipelineError::AlreadyStarted);
        }
        runtime.lifecycle = Lifecycle::Running;

        runtime.sampler_task = Some(tokio::spawn(
            Arc::clone(self).sampler_loop(runtime.stop_tx.subscribe()),
        ));
        runtime.intensity_task = Some(tokio::spawn(
            Arc::clone(self).intensity_loop(runtime.stop_tx.subscribe()),
        ));
        runtime.flush_task = runtime.worker.take().map(|w| tokio::spawn(w.run()));

        tracing::info!(
            interval_ms = u64::try_from(self.sample_interval.as_millis()).unwrap_or(u64::MAX),
            refresh_ms = u64::try_from(self.refresh_interval.as_millis()).unwrap_or(u64::MAX),
            persistence = runtime.flush_task.is_some(),
            "Pipeline started"
        );
        Ok(())
    }

    /// Stop the loops, close open blocks, and drain the flush queue.
    ///
    /// Blocks still queued when the shutdown timeout expires are lost and
    /// logged. Calling `stop` on an idle or stopped pipeline does nothing.
    pub async fn stop(&self) {
        let (sampler_task, intensity_task, flush_task) = {
            let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
            if runtime.lifecycle != Lifecycle::Running {
                return;
            }
            runtime.lifecycle = Lifecycle::Stopped;
            runtime.stop_tx.send_replace(true);
            (
                runtime.sampler_task.take(),
                runtime.intensity_task.take(),
                runtime.flush_task.take(),
            )
        };
        tracing::info!("Pipeline stopping");

        for (name, task) in [("sampler", sampler_task), ("intensity", intensity_task)] {
            let Some(task) = task else { continue };
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Background task ended abnormally");
            }
        }

        let closed = self.builder.close_all();
        self.enqueue(closed);

        // Dropping the last sender lets the worker finish once drained.
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(queue);

        if let Some(mut task) = flush_task {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => tracing::info!("Flush queue drained"),
                Ok(Err(e)) => tracing::error!(error = %e, "Flush worker ended abnormally"),
                Err(_) => {
                    task.abort();
                    let pending = self
                        .flush_stats
                        .as_ref()
                        .map_or(0, |stats| stats.snapshot().pending);
                    tracing::error!(
                        pending,
                        timeout_ms =
                            u64::try_from(self.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Flush worker did not drain in time; pending blocks lost"
                    );
                }
            }
        }
        tracing::info!("Pipeline stopped");
    }

    async fn sampler_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = stop.changed() => break,
                result = self.sample_once() => {
                    if let Err(e) = result {
                        tracing::warn!(exporter = self.exporter.name(), error = %e, "Exporter poll failed");
                    }
                }
            }
        }
        tracing::info!("Sampler loop stopped");
    }

    async fn intensity_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = stop.changed() => break,
                _ = self.refresh_intensity(Utc::now()) => {}
            }
        }
        tracing::info!("Intensity loop stopped");
    }

    // -----------------------------------------------------------------------
    // Work units
    // -----------------------------------------------------------------------

    /// Poll the exporter once and ingest the derived measurements.
    ///
    /// The snapshot's timestamp is used as the tick time.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError`] if the poll failed; the failure is also
    /// recorded in [`Pipeline::health`].
    pub async fn sample_once(&self) -> Result<SampleReport, ExporterError> {
        let snapshot = match self.exporter.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.health.record_error(e.to_string());
                return Err(e);
            }
        };
        let measurements = self
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process(&snapshot);
        let count = measurements.len();
        let closed_blocks = self.ingest(snapshot.taken_at, measurements);
        self.health.record_success(snapshot.taken_at);
        tracing::debug!(measurements = count, closed_blocks, "Sample ingested");
        Ok(SampleReport {
            measurements: count,
            closed_blocks,
        })
    }

    /// Run one block-builder tick at `now`, queue closed blocks for
    /// persistence, and evict expired blocks.
    ///
    /// Returns the number of blocks closed.
    pub fn ingest(&self, now: DateTime<Utc>, measurements: Vec<(ContainerKey, Measurement)>) -> usize {
        let closed = self.builder.tick(now, measurements);
        let count = closed.len();
        self.enqueue(closed);
        let evicted = self.buffer.evict(now);
        if evicted > 0 {
            tracing::debug!(evicted, %now, "Evicted expired blocks");
        }
        count
    }

    fn enqueue(&self, blocks: Vec<Arc<Block>>) {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(queue) = queue {
            for block in blocks {
                queue.enqueue(block);
            }
        }
    }

    /// Refresh intensities and persist what was recorded.
    pub async fn refresh_intensity(&self, now: DateTime<Utc>) -> RefreshReport {
        let report = self.intensity.refresh(now).await;
        let Some(store) = self.store.as_ref().filter(|_| !report.recorded.is_empty()) else {
            return report;
        };
        if let Err(e) = store.insert_intensities(&report.recorded).await {
            tracing::warn!(error = %e, points = report.recorded.len(), "Failed to persist intensity points");
        }
        report
    }

    /// Reload persisted intensity history within the retention window.
    ///
    /// Returns the number of points restored; store failures are logged
    /// and restore nothing.
    pub async fn restore_intensity(&self, now: DateTime<Utc>) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let since = now
            .checked_sub_signed(self.intensity_retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        match store.load_intensities(since).await {
            Ok(points) => self.intensity.restore(points, now),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to restore intensity history");
                0
            }
        }
    }

    /// One exporter poll used as a startup self-check.
    ///
    /// Returns the number of containers reported. The sampler state is not
    /// touched.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError`] if the exporter cannot be polled.
    pub async fn check_exporter(&self) -> Result<usize, ExporterError> {
        self.exporter.snapshot().await.map(|s| s.readings.len())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Answer an emission query.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] if a requested country is not tracked.
    pub async fn query(&self, query: &Co2Query) -> Result<Co2Response, QueryError> {
        self.query.execute(query).await
    }

    /// Every key known to the buffer or the store, sorted.
    ///
    /// The flag is `true` when the store could not be listed in time and
    /// only buffered keys are returned.
    pub async fn containers(&self) -> (Vec<ContainerKey>, bool) {
        let mut keys: BTreeSet<ContainerKey> = self.buffer.keys().into_iter().collect();
        let Some(store) = &self.store else {
            return (keys.into_iter().collect(), false);
        };
        let degraded = match tokio::time::timeout(self.request_timeout, store.list_keys()).await {
            Ok(Ok(persisted)) => {
                keys.extend(persisted);
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to list persisted containers");
                true
            }
            Err(_) => {
                tracing::warn!("Listing persisted containers timed out");
                true
            }
        };
        (keys.into_iter().collect(), degraded)
    }

    /// Evaluate readiness at `now`.
    pub async fn readiness(&self, now: DateTime<Utc>) -> Readiness {
        let mut reasons = Vec::new();

        {
            let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
            match runtime.lifecycle {
                Lifecycle::Idle => reasons.push(String::from("pipeline not started")),
                Lifecycle::Stopped => reasons.push(String::from("pipeline stopped")),
                Lifecycle::Running => {
                    if runtime.sampler_task.as_ref().is_none_or(JoinHandle::is_finished) {
                        reasons.push(String::from("sampler loop not running"));
                    }
                    if runtime.intensity_task.as_ref().is_none_or(JoinHandle::is_finished) {
                        reasons.push(String::from("intensity loop not running"));
                    }
                }
            }
        }

        let last_success = self.health.last_success();
        match last_success {
            None => reasons.push(String::from("no successful sample yet")),
            Some(at) => {
                let threshold = staleness_threshold(self.sample_interval_secs);
                if now.signed_duration_since(at) > threshold {
                    reasons.push(format!(
                        "last successful sample is older than {}s",
                        threshold.num_seconds()
                    ));
                }
            }
        }

        let flush = self.flush_stats.as_ref().map(|stats| stats.snapshot());
        if flush.as_ref().is_some_and(|f| !f.worker_alive) {
            reasons.push(String::from("flush worker not running"));
        }

        if let Some(store) = &self.store {
            match tokio::time::timeout(self.request_timeout, store.ping()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => reasons.push(format!("store unreachable: {e}")),
                Err(_) => reasons.push(String::from("store ping timed out")),
            }
        }

        Readiness {
            ready: reasons.is_empty(),
            reasons,
            last_sample_success: last_success,
            last_sample_error: self.health.last_error(),
            flush,
        }
    }
}
