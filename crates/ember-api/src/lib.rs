//! HTTP/JSON query API for the Ember CO2 collector.
//!
//! This crate provides an Axum server that exposes:
//!
//! - **Emission queries** (`POST /api/co2-per-container`) over a range or
//!   the newest N measurements of one container, in one or more countries
//! - **Discovery** of known containers (`GET /api/containers`) and the
//!   latest carbon intensity per tracked country
//!   (`GET /api/co2-intensities`)
//! - **Probes**: `GET /healthz` for liveness and `GET /readyz` for
//!   dependency readiness
//!
//! # Architecture
//!
//! Handlers hold an `Arc` of the running [`Pipeline`] and never touch the
//! background loops directly. Query bodies are parsed into a
//! [`Co2Request`], validated into a typed [`Co2Query`], and answered by the
//! pipeline's query engine. Failures map onto [`ApiError`], whose JSON body
//! carries a stable `kind` and `reason`.
//!
//! [`Pipeline`]: ember_core::Pipeline
//! [`Co2Request`]: ember_types::Co2Request
//! [`Co2Query`]: ember_types::Co2Query

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

// Re-export primary types for convenience.
pub use error::ApiError;
pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::AppState;
