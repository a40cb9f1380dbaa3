//! Axum router construction for the query API.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the complete Axum router.
///
/// The router includes:
/// - `POST /api/co2-per-container` -- emission query
/// - `GET /api/containers` -- known containers
/// - `GET /api/co2-intensities` -- latest intensities
/// - `GET /healthz` -- liveness
/// - `GET /readyz` -- readiness
///
/// CORS allows any origin so dashboards on other hosts can query the
/// collector directly.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/co2-per-container", post(handlers::co2_per_container))
        .route("/api/containers", get(handlers::list_containers))
        .route("/api/co2-intensities", get(handlers::list_intensities))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
