//! End-to-end pipeline tests against the in-memory store.
//!
//! Measurements are fed through [`Pipeline::ingest`] with explicit tick
//! times so block boundaries, flushing, and eviction are deterministic.
//! Tests that start the background loops use a scripted exporter and an
//! empty static intensity table.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::float_cmp
)]

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use ember_core::{
    CollectorConfig, ExporterSnapshot, ExporterSource, IntensitySource, Pipeline, QueryError,
    Reading, ScriptedExporter,
};
use ember_db::{MemoryStore, MetricsStore};
use ember_types::{
    Co2Query, Co2Response, ContainerKey, CountryCode, IntensityPoint, Measurement, QueryStatus, RequestError,
    Selection, SelectionMode,
};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    base() + TimeDelta::seconds(secs)
}

fn key() -> ContainerKey {
    ContainerKey::new("web-7d9f", "nginx", "default")
}

fn de() -> CountryCode {
    CountryCode::parse("DE").unwrap()
}

fn config(persist: bool) -> CollectorConfig {
    let mut config = CollectorConfig::default();
    config.persistence.enabled = persist;
    config.persistence.database_url = persist.then(|| String::from("memory"));
    config.persistence.max_attempts = 3;
    config.persistence.backoff_base_ms = 1;
    config.persistence.backoff_max_ms = 4;
    config.intensity.fetch_attempts = 1;
    config.intensity.retry_delay_ms = 0;
    config
}

fn pipeline(
    config: &CollectorConfig,
    exporter: ScriptedExporter,
    store: Option<&Arc<MemoryStore>>,
) -> Arc<Pipeline> {
    Pipeline::build(
        config,
        ExporterSource::Scripted(exporter),
        IntensitySource::Static(BTreeMap::new()),
        store.map(|s| MetricsStore::from(Arc::clone(s))),
    )
    .unwrap()
}

fn query(countries: &[&str], selection: Selection) -> Co2Query {
    Co2Query {
        key: key(),
        countries: countries
            .iter()
            .map(|c| CountryCode::parse(c).unwrap())
            .collect(),
        selection,
    }
}

fn last_n(n: usize) -> Selection {
    Selection::LastN(NonZeroUsize::new(n).unwrap())
}

fn with_de_intensity(pipeline: &Pipeline) {
    pipeline.intensity().restore(
        vec![IntensityPoint {
            country: de(),
            hour: base(),
            value_g_per_kwh: 400.0,
        }],
        base(),
    );
}

/// Range and last-N over the same rows must yield the same rows and the
/// same per-country totals.
fn assert_same_answer(range: &Co2Response, latest: &Co2Response, rows: usize) {
    let range_stamps: Vec<_> = range.measurements.iter().map(|m| m.timestamp).collect();
    let latest_stamps: Vec<_> = latest.measurements.iter().map(|m| m.timestamp).collect();
    assert_eq!(range_stamps.len(), rows);
    assert_eq!(range_stamps, latest_stamps);

    let range_de = &range.per_country[&de()];
    let latest_de = &latest.per_country[&de()];
    assert!(range_de.co2_g.is_some_and(|g| g > 0.0));
    assert_eq!(range_de.co2_g, latest_de.co2_g);
    assert_eq!(range_de.energy_j, latest_de.energy_j);
    assert!(!range.persistence_degraded);
    assert!(!latest.persistence_degraded);
}

fn feed(pipeline: &Pipeline, seconds: impl IntoIterator<Item = i64>, jps: f64) {
    for s in seconds {
        pipeline.ingest(at(s), vec![(key(), Measurement::new(at(s), jps))]);
    }
}

// ---------------------------------------------------------------------------
// Emissions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_samples_at_restored_intensity() {
    let memory = Arc::new(MemoryStore::new());
    memory
        .insert_intensities(&[IntensityPoint {
            country: de(),
            hour: base(),
            value_g_per_kwh: 400.0,
        }])
        .unwrap();
    let pipeline = pipeline(&config(true), ScriptedExporter::new(), Some(&memory));
    assert_eq!(pipeline.restore_intensity(at(60)).await, 1);

    for (s, jps) in [(10, 100.0), (20, 120.0), (30, 110.0)] {
        pipeline.ingest(at(s), vec![(key(), Measurement::new(at(s), jps))]);
    }

    let response = pipeline.query(&query(&["DE"], last_n(5))).await.unwrap();
    assert_eq!(response.status, QueryStatus::Ok);
    assert_eq!(response.selection_mode, SelectionMode::LastN);
    assert_eq!(response.measurement_count, 3);
    assert_eq!(response.primary_country, de());
    assert_eq!(response.sample_interval_seconds, 10.0);

    let totals = &response.per_country[&de()];
    assert_eq!(totals.energy_j, 3_300.0);
    assert!((totals.co2_g.unwrap() - 0.366_666_7).abs() < 1e-6);
    assert_eq!(totals.missing_intensity, 0);

    let first = &response.measurements[0];
    assert_eq!(first.energy_j, 1_000.0);
    assert_eq!(first.intensity_g_per_kwh, Some(400.0));
    assert!((first.co2_gps.unwrap() - 100.0 / 3_600_000.0 * 400.0).abs() < 1e-12);
}

#[tokio::test]
async fn intensity_falls_back_to_earlier_hour() {
    let memory = Arc::new(MemoryStore::new());
    memory
        .insert_intensities(&[IntensityPoint {
            country: de(),
            hour: base(),
            value_g_per_kwh: 300.0,
        }])
        .unwrap();
    let pipeline = pipeline(&config(true), ScriptedExporter::new(), Some(&memory));
    pipeline.restore_intensity(at(7_200)).await;

    feed(&pipeline, [7_210], 36.0);
    let response = pipeline.query(&query(&["DE", "FR"], last_n(1))).await.unwrap();

    let m = &response.measurements[0];
    assert_eq!(m.intensity_g_per_kwh, Some(300.0));
    assert!(response.per_country[&de()].co2_g.is_some());

    let fr = &response.per_country[&CountryCode::parse("FR").unwrap()];
    assert_eq!(fr.co2_g, None);
    assert_eq!(fr.missing_intensity, 1);
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn range_is_half_open() {
    let pipeline = pipeline(&config(false), ScriptedExporter::new(), None);
    feed(&pipeline, (0..10).map(|i| i * 10), 5.0);

    let response = pipeline
        .query(&query(&["DE"], Selection::Range { start: at(20), end: at(50) }))
        .await
        .unwrap();
    let stamps: Vec<_> = response.measurements.iter().map(|m| m.timestamp).collect();
    assert_eq!(stamps, vec![at(20), at(30), at(40)]);
    assert_eq!(response.resolved_start, Some(at(20)));
    assert_eq!(response.resolved_end, Some(at(50)));

    let response = pipeline
        .query(&query(&["DE"], Selection::Range { start: at(50), end: at(60) }))
        .await
        .unwrap();
    assert_eq!(response.measurement_count, 1);
}

#[tokio::test]
async fn range_and_last_n_agree_on_buffered_rows() {
    let pipeline = pipeline(&config(false), ScriptedExporter::new(), None);
    with_de_intensity(&pipeline);
    feed(&pipeline, (0..10).map(|i| i * 10), 7.0);

    let range = pipeline
        .query(&query(&["DE"], Selection::Range { start: at(0), end: at(100) }))
        .await
        .unwrap();
    let latest = pipeline.query(&query(&["DE"], last_n(10))).await.unwrap();
    assert_same_answer(&range, &latest, 10);
}

#[tokio::test]
async fn range_and_last_n_agree_after_flush_and_eviction() {
    let memory = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&config(true), ScriptedExporter::new(), Some(&memory));
    with_de_intensity(&pipeline);
    pipeline.start().unwrap();

    feed(&pipeline, (0..10).map(|i| i * 10), 7.0);
    // Past the retention horizon: both blocks close and leave the buffer.
    pipeline.ingest(at(7_300), Vec::new());
    assert!(pipeline.buffer().snapshot(&key()).is_empty());

    pipeline.stop().await;
    assert_eq!(memory.row_count(), 10);

    let range = pipeline
        .query(&query(&["DE"], Selection::Range { start: at(0), end: at(100) }))
        .await
        .unwrap();
    let latest = pipeline.query(&query(&["DE"], last_n(10))).await.unwrap();
    assert_same_answer(&range, &latest, 10);
}

#[tokio::test]
async fn last_n_spans_store_and_buffer_without_duplicates() {
    let memory = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&config(true), ScriptedExporter::new(), Some(&memory));
    with_de_intensity(&pipeline);
    pipeline.start().unwrap();

    feed(&pipeline, (0..8).map(|i| i * 10), 1.0);
    // Evicts [0, 50) but keeps [50, 100), so the seam sits at 50.
    pipeline.ingest(at(7_260), Vec::new());
    pipeline.stop().await;
    assert_eq!(pipeline.buffer().snapshot(&key()).earliest_start(), Some(at(50)));
    assert_eq!(memory.row_count(), 8);

    let response = pipeline.query(&query(&["DE"], last_n(8))).await.unwrap();
    let stamps: Vec<_> = response.measurements.iter().map(|m| m.timestamp).collect();
    let expected: Vec<_> = (0..8).map(|i| at(i * 10)).collect();
    assert_eq!(stamps, expected);

    let range = pipeline
        .query(&query(&["DE"], Selection::Range { start: at(0), end: at(80) }))
        .await
        .unwrap();
    assert_same_answer(&range, &response, 8);
}

#[tokio::test]
async fn unknown_key_is_no_data() {
    let pipeline = pipeline(&config(false), ScriptedExporter::new(), None);
    let response = pipeline.query(&query(&["DE"], last_n(5))).await.unwrap();

    assert_eq!(response.status, QueryStatus::NoData);
    assert_eq!(response.measurement_count, 0);
    assert!(response.measurements.is_empty());
    assert_eq!(response.resolved_start, None);
    assert_eq!(response.per_country[&de()].co2_g, Some(0.0));
}

#[tokio::test]
async fn untracked_country_is_rejected() {
    let pipeline = pipeline(&config(false), ScriptedExporter::new(), None);
    let err = pipeline.query(&query(&["ZZ"], last_n(5))).await.unwrap_err();
    assert_eq!(
        err,
        QueryError::Validation(RequestError::UnsupportedCountry(String::from("ZZ")))
    );
}

// ---------------------------------------------------------------------------
// Flushing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn flush_retries_transient_store_failures() {
    let memory = Arc::new(MemoryStore::new());
    memory.fail_next_writes(2);
    let pipeline = pipeline(&config(true), ScriptedExporter::new(), Some(&memory));
    pipeline.start().unwrap();

    feed(&pipeline, [0, 10, 20], 1.0);
    pipeline.stop().await;

    let stats = pipeline.flush_stats().unwrap().snapshot();
    assert_eq!((stats.flushed, stats.dropped, stats.pending), (1, 0, 0));
    assert_eq!(memory.row_count(), 3);
}

#[tokio::test]
async fn flush_drops_block_after_exhausting_retries() {
    let memory = Arc::new(MemoryStore::new());
    memory.fail_next_writes(100);
    let pipeline = pipeline(&config(true), ScriptedExporter::new(), Some(&memory));
    pipeline.start().unwrap();

    feed(&pipeline, [0, 10], 1.0);
    pipeline.stop().await;

    let stats = pipeline.flush_stats().unwrap().snapshot();
    assert_eq!((stats.flushed, stats.dropped), (0, 1));
    assert!(stats.last_error.is_some());
    assert_eq!(memory.row_count(), 0);
}

#[test]
fn persistence_without_store_is_a_config_error() {
    let result = Pipeline::build(
        &config(true),
        ExporterSource::Scripted(ScriptedExporter::new()),
        IntensitySource::Static(BTreeMap::new()),
        None,
    );
    assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// Sampling, listing, and readiness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn counter_readings_become_rates() {
    let exporter = ScriptedExporter::new();
    for (s, joules) in [(0, 1_000.0), (10, 2_000.0)] {
        exporter.push(ExporterSnapshot {
            taken_at: at(s),
            readings: BTreeMap::from([(key(), Reading::counter(joules))]),
        });
    }
    exporter.push_failure("connection refused");
    let pipeline = pipeline(&config(false), exporter, None);

    assert_eq!(pipeline.sample_once().await.unwrap().measurements, 0);
    assert_eq!(pipeline.sample_once().await.unwrap().measurements, 1);
    assert_eq!(pipeline.health().last_success(), Some(at(10)));

    assert!(pipeline.sample_once().await.is_err());
    assert!(pipeline.health().last_error().is_some());

    let buffered = pipeline.buffer().last_n(&key(), 5);
    assert_eq!(buffered, vec![Measurement::new(at(10), 100.0)]);
}

#[tokio::test]
async fn containers_merge_buffer_and_store() {
    let memory = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&config(true), ScriptedExporter::new(), Some(&memory));
    pipeline.start().unwrap();

    let other = ContainerKey::new("db-0", "postgres", "data");
    pipeline.ingest(at(0), vec![(other.clone(), Measurement::new(at(0), 1.0))]);
    pipeline.ingest(at(7_300), Vec::new());
    pipeline.stop().await;
    assert!(pipeline.buffer().snapshot(&other).is_empty());
    feed(&pipeline, [7_310], 1.0);

    let (keys, degraded) = pipeline.containers().await;
    assert!(!degraded);
    let mut expected = vec![key(), other];
    expected.sort();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn readiness_follows_lifecycle() {
    let memory = Arc::new(MemoryStore::new());
    let exporter =
        ScriptedExporter::constant(BTreeMap::from([(key(), Reading::rate(42.0))]));
    let pipeline = pipeline(&config(true), exporter, Some(&memory));

    let idle = pipeline.readiness(Utc::now()).await;
    assert!(!idle.ready);
    assert!(idle.reasons.iter().any(|r| r.contains("not started")));

    pipeline.start().unwrap();
    assert!(pipeline.start().is_err());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pipeline.health().last_success().is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let running = pipeline.readiness(Utc::now()).await;
    assert!(running.ready, "reasons: {:?}", running.reasons);
    assert!(running.flush.unwrap().worker_alive);

    let stale = pipeline.readiness(Utc::now() + TimeDelta::seconds(120)).await;
    assert!(!stale.ready);

    pipeline.stop().await;
    let stopped = pipeline.readiness(Utc::now()).await;
    assert!(!stopped.ready);
    assert!(stopped.reasons.iter().any(|r| r.contains("stopped")));
}
