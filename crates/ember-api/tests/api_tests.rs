//! Integration tests for the query API endpoints.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server. The pipeline behind the router uses the
//! in-memory store and is fed through `ingest`, so no background loops
//! run.

#![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::float_cmp)]

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use ember_api::router::build_router;
use ember_api::state::AppState;
use ember_core::{CollectorConfig, ExporterSource, IntensitySource, Pipeline, ScriptedExporter};
use ember_db::{MemoryStore, MetricsStore};
use ember_types::{ContainerKey, CountryCode, IntensityPoint, Measurement};
use serde_json::Value;
use tower::ServiceExt;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
}

fn key() -> ContainerKey {
    ContainerKey::new("web-7d9f", "nginx", "default")
}

async fn make_test_state() -> Arc<AppState> {
    let memory = Arc::new(MemoryStore::new());
    memory
        .insert_intensities(&[IntensityPoint {
            country: CountryCode::parse("DE").unwrap(),
            hour: at(0),
            value_g_per_kwh: 400.0,
        }])
        .unwrap();

    let mut config = CollectorConfig::default();
    config.persistence.enabled = true;
    config.persistence.database_url = Some(String::from("memory"));

    let pipeline = Pipeline::build(
        &config,
        ExporterSource::Scripted(ScriptedExporter::new()),
        IntensitySource::Static(BTreeMap::new()),
        Some(MetricsStore::from(memory)),
    )
    .unwrap();
    pipeline.restore_intensity(at(60)).await;

    for (s, jps) in [(10, 100.0), (20, 120.0), (30, 110.0)] {
        pipeline.ingest(at(s), vec![(key(), Measurement::new(at(s), jps))]);
    }
    let other = ContainerKey::new("db-0", "postgres", "data");
    pipeline.ingest(at(40), vec![(other, Measurement::new(at(40), 1.0))]);

    Arc::new(AppState::new(pipeline))
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post_co2(body: Value) -> (StatusCode, Value) {
    let router = build_router(make_test_state().await);
    let response = router
        .oneshot(
            Request::post("/api/co2-per-container")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    (status, body_to_json(response.into_body()).await)
}

// =========================================================================
// Emission queries
// =========================================================================

#[tokio::test]
async fn test_co2_last_n_defaults() {
    let (status, json) = post_co2(serde_json::json!({
        "pod": "web-7d9f",
        "container": "nginx",
        "namespace": "default",
    }))
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["selection_mode"], "last_n");
    assert_eq!(json["measurement_count"], 3);
    assert_eq!(json["primary_country"], "DE");
    assert_eq!(json["per_country"]["DE"]["energy_j"], 3_300.0);

    let total = json["per_country"]["DE"]["co2_g"].as_f64().unwrap();
    assert!((total - 0.366_666_7).abs() < 1e-6);

    let measurements = json["measurements"].as_array().unwrap();
    assert_eq!(measurements.len(), 3);
    assert_eq!(measurements[0]["joules_per_second"], 100.0);
    assert_eq!(measurements[0]["intensity_g_per_kwh"], 400.0);
}

#[tokio::test]
async fn test_co2_range_is_half_open() {
    let (status, json) = post_co2(serde_json::json!({
        "pod": "web-7d9f",
        "container": "nginx",
        "namespace": "default",
        "start_time": at(10).to_rfc3339(),
        "end_time": at(30).to_rfc3339(),
    }))
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["selection_mode"], "range");
    assert_eq!(json["measurement_count"], 2);
}

#[tokio::test]
async fn test_co2_unknown_container_is_no_data() {
    let (status, json) = post_co2(serde_json::json!({
        "pod": "ghost",
        "container": "none",
        "namespace": "default",
        "n": 10,
    }))
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "no_data");
    assert_eq!(json["measurement_count"], 0);
    assert_eq!(json["measurements"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_co2_range_and_n_is_rejected() {
    let (status, json) = post_co2(serde_json::json!({
        "pod": "web-7d9f",
        "container": "nginx",
        "namespace": "default",
        "start_time": at(0).to_rfc3339(),
        "end_time": at(60).to_rfc3339(),
        "n": 3,
    }))
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["status"], 400);
    assert_eq!(json["error"]["kind"], "validation_error");
    assert_eq!(json["error"]["reason"], "contradictory_selection");
    assert!(json.get("measurements").is_none());
}

#[tokio::test]
async fn test_co2_unsupported_country_is_named() {
    let (status, json) = post_co2(serde_json::json!({
        "pod": "web-7d9f",
        "container": "nginx",
        "namespace": "default",
        "countries": ["DE", "ZZ"],
    }))
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["reason"], "unsupported_country");
    assert!(json["error"]["message"].as_str().unwrap().contains("ZZ"));
}

#[tokio::test]
async fn test_co2_unknown_field_is_malformed() {
    let (status, json) = post_co2(serde_json::json!({
        "pod": "web-7d9f",
        "container": "nginx",
        "namespace": "default",
        "limit": 3,
    }))
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["reason"], "malformed_body");
}

#[tokio::test]
async fn test_co2_missing_intensity_nulls_country() {
    let (status, json) = post_co2(serde_json::json!({
        "pod": "web-7d9f",
        "container": "nginx",
        "namespace": "default",
        "countries": ["DE", "FR"],
        "n": 1,
    }))
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["per_country"]["DE"]["co2_g"].is_number());
    assert!(json["per_country"]["FR"]["co2_g"].is_null());
    assert_eq!(json["per_country"]["FR"]["error_kind"], "no_intensity_data");
}

// =========================================================================
// Discovery and health checks
// =========================================================================

#[tokio::test]
async fn test_list_containers_sorted() {
    let router = build_router(make_test_state().await);
    let response = router
        .oneshot(Request::get("/api/containers").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["count"], 2);
    assert_eq!(json["containers"][0]["pod"], "db-0");
    assert_eq!(json["containers"][1]["pod"], "web-7d9f");
    assert_eq!(json["persistence_degraded"], false);
}

#[tokio::test]
async fn test_list_intensities() {
    let router = build_router(make_test_state().await);
    let response = router
        .oneshot(
            Request::get("/api/co2-intensities")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["intensities"][0]["country"], "DE");
    assert_eq!(json["intensities"][0]["value"], 400.0);
    assert!(
        json["missing"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "FR")
    );
}

#[tokio::test]
async fn test_healthz() {
    let router = build_router(make_test_state().await);
    let response = router
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_readyz_unavailable_before_start() {
    let router = build_router(make_test_state().await);
    let response = router
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["ready"], false);
    assert!(!json["reasons"].as_array().unwrap().is_empty());
    assert_eq!(json["flush"]["worker_alive"], false);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let router = build_router(make_test_state().await);
    let response = router
        .oneshot(Request::get("/api/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
