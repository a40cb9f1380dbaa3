//! Shared type definitions for the Ember CO2 telemetry collector.
//!
//! This crate is the single source of truth for the data model used across
//! the workspace: the identity of a monitored workload, the measurements and
//! time-aligned blocks the pipeline moves around, carbon-intensity points,
//! and the typed request/response shapes of the query API.
//!
//! # Modules
//!
//! - [`ids`] -- [`ContainerKey`] and [`CountryCode`] identities
//! - [`structs`] -- [`Measurement`], [`Block`], and [`IntensityPoint`]
//! - [`grid`] -- Epoch-aligned block grid and hour bucketing
//! - [`api`] -- Query request validation and response types

pub mod api;
pub mod grid;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use api::{
    Co2Query, Co2Request, Co2Response, CountryEmission, CountryTotals, MeasurementReport,
    QueryStatus, RequestError, Selection, SelectionMode, DEFAULT_LAST_N, MAX_LAST_N,
};
pub use grid::{hour_bucket, BlockGrid, GridError};
pub use ids::{ContainerKey, CountryCode, CountryCodeError};
pub use structs::{Block, BlockError, IntensityPoint, Measurement};
