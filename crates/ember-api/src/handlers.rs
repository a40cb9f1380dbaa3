//! Endpoint handlers for the query API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/co2-per-container` | Emissions for one container |
//! | `GET` | `/api/containers` | Known containers, sorted |
//! | `GET` | `/api/co2-intensities` | Latest intensity per tracked country |
//! | `GET` | `/healthz` | Process liveness |
//! | `GET` | `/readyz` | Dependency readiness (200 or 503) |

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use ember_types::Co2Request;

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// POST /api/co2-per-container
// ---------------------------------------------------------------------------

/// Compute emissions for one container over a time range or its newest
/// N measurements.
///
/// The body is read raw so malformed JSON and unknown fields surface as
/// validation errors with the standard error body instead of Axum's
/// rejection text.
pub async fn co2_per_container(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let query =
        Co2Request::from_json(&body)?.into_query(state.pipeline.default_country())?;

    let deadline_ms = u64::try_from(state.query_deadline.as_millis()).unwrap_or(u64::MAX);
    let response =
        match tokio::time::timeout(state.query_deadline, state.pipeline.query(&query)).await {
            Ok(result) => result?,
            Err(_) => return Err(ApiError::Timeout(deadline_ms)),
        };

    tracing::debug!(
        key = %query.key,
        status = ?response.status,
        measurements = response.measurement_count,
        degraded = response.persistence_degraded,
        "Emission query answered"
    );
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// GET /api/containers
// ---------------------------------------------------------------------------

/// List every container seen in the buffer or the store.
pub async fn list_containers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (containers, degraded) = state.pipeline.containers().await;
    Json(serde_json::json!({
        "count": containers.len(),
        "containers": containers,
        "persistence_degraded": degraded,
    }))
}

// ---------------------------------------------------------------------------
// GET /api/co2-intensities
// ---------------------------------------------------------------------------

/// Latest known intensity per tracked country.
///
/// Tracked countries without any value yet are listed under `missing`.
pub async fn list_intensities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tracker = state.pipeline.intensity();
    let points = tracker.latest();
    let missing: Vec<_> = tracker
        .countries()
        .iter()
        .filter(|c| !points.iter().any(|p| &p.country == *c))
        .collect();

    Json(serde_json::json!({
        "source": tracker.source_name(),
        "refreshed_at": tracker.snapshot().refreshed_at(),
        "count": points.len(),
        "intensities": points,
        "missing": missing,
    }))
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Liveness: the process is up and serving.
pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Readiness: sampler freshness, loop liveness, and store connectivity.
pub async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.pipeline.readiness(Utc::now()).await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}
