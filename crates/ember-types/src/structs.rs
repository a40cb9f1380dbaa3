//! Core data structs moved through the pipeline.
//!
//! A [`Measurement`] is one sampled power reading. Measurements for one
//! [`ContainerKey`] are grouped into [`Block`]s that cover one cell of the
//! shared block grid; a block is the unit that is buffered, flushed, and
//! evicted. [`IntensityPoint`] carries one hourly carbon-intensity value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ContainerKey, CountryCode};

/// One instantaneous power reading for a container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Average power draw over the sampling interval, in watts.
    pub joules_per_second: f64,
}

impl Measurement {
    /// Create a measurement.
    pub const fn new(timestamp: DateTime<Utc>, joules_per_second: f64) -> Self {
        Self {
            timestamp,
            joules_per_second,
        }
    }
}

/// Reasons a block refuses a measurement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    /// The block's bounds are empty or inverted.
    #[error("invalid block bounds: start {start} is not before end {end}")]
    InvalidBounds {
        /// Requested start.
        start: DateTime<Utc>,
        /// Requested end.
        end: DateTime<Utc>,
    },

    /// The measurement lies outside `[start, end)`.
    #[error("measurement at {timestamp} outside block [{start}, {end})")]
    OutOfBounds {
        /// Timestamp of the rejected measurement.
        timestamp: DateTime<Utc>,
        /// Block start.
        start: DateTime<Utc>,
        /// Block end.
        end: DateTime<Utc>,
    },

    /// The measurement is not strictly after the previous one.
    #[error("measurement at {timestamp} does not follow previous at {previous}")]
    NotIncreasing {
        /// Timestamp of the rejected measurement.
        timestamp: DateTime<Utc>,
        /// Timestamp of the last accepted measurement.
        previous: DateTime<Utc>,
    },
}

/// A time-aligned batch of measurements for one container.
///
/// Every contained measurement satisfies `start <= timestamp < end`, and
/// timestamps are strictly increasing. Fields are private so those
/// invariants can only be established through [`Block::push`] or
/// [`Block::with_measurements`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    key: ContainerKey,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    measurements: Vec<Measurement>,
}

impl Block {
    /// Create an empty block covering `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::InvalidBounds`] if `start >= end`.
    pub fn new(
        key: ContainerKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, BlockError> {
        if start >= end {
            return Err(BlockError::InvalidBounds { start, end });
        }
        Ok(Self {
            key,
            start,
            end,
            measurements: Vec::new(),
        })
    }

    /// Build a block from an already ordered list of measurements.
    ///
    /// # Errors
    ///
    /// Returns the first [`BlockError`] any measurement triggers.
    pub fn with_measurements(
        key: ContainerKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        measurements: impl IntoIterator<Item = Measurement>,
    ) -> Result<Self, BlockError> {
        let mut block = Self::new(key, start, end)?;
        for m in measurements {
            block.push(m)?;
        }
        Ok(block)
    }

    /// The container this block belongs to.
    pub const fn key(&self) -> &ContainerKey {
        &self.key
    }

    /// Inclusive start of the block.
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive end of the block.
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Measurements in ascending timestamp order.
    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Number of measurements held.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Whether the block holds no measurements.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Whether `ts` falls in `[start, end)`.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Append a measurement.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] if the timestamp is outside the
    /// block, or [`BlockError::NotIncreasing`] if it does not come strictly
    /// after the last measurement.
    pub fn push(&mut self, measurement: Measurement) -> Result<(), BlockError> {
        if !self.contains(measurement.timestamp) {
            return Err(BlockError::OutOfBounds {
                timestamp: measurement.timestamp,
                start: self.start,
                end: self.end,
            });
        }
        if let Some(last) = self.measurements.last() {
            if measurement.timestamp <= last.timestamp {
                return Err(BlockError::NotIncreasing {
                    timestamp: measurement.timestamp,
                    previous: last.timestamp,
                });
            }
        }
        self.measurements.push(measurement);
        Ok(())
    }

    /// Measurements with `start <= timestamp < end`, in order.
    pub fn slice(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl DoubleEndedIterator<Item = &Measurement> + '_ {
        self.measurements
            .iter()
            .filter(move |m| start <= m.timestamp && m.timestamp < end)
    }

    /// Whether any part of the block intersects `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }
}

/// Carbon intensity of one country's grid for one UTC hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntensityPoint {
    /// Country the value applies to.
    pub country: CountryCode,
    /// Start of the UTC hour the value covers.
    pub hour: DateTime<Utc>,
    /// Grams of CO2 per kilowatt-hour.
    #[serde(rename = "value")]
    pub value_g_per_kwh: f64,
}
