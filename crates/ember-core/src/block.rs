//! Block closing and appending on each sampler tick.
//!
//! Every tick first closes all open blocks whose end is at or before the
//! tick time, including blocks of keys missing from the snapshot, and
//! only then appends the new measurements. A measurement stamped exactly
//! on a grid line therefore starts the next block.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ember_types::{Block, ContainerKey, Measurement};

use crate::buffer::BufferStore;

/// Feeds measurements into the buffer and collects closed blocks.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    buffer: Arc<BufferStore>,
}

impl BlockBuilder {
    /// Create a builder writing into `buffer`.
    pub const fn new(buffer: Arc<BufferStore>) -> Self {
        Self { buffer }
    }

    /// Run one tick: close due blocks, then append `measurements`.
    ///
    /// Returns every block closed during the tick, oldest first per key.
    /// Rejected measurements are logged and skipped.
    pub fn tick(
        &self,
        now: DateTime<Utc>,
        measurements: Vec<(ContainerKey, Measurement)>,
    ) -> Vec<Arc<Block>> {
        let mut closed = self.buffer.close_due(now);
        for (key, measurement) in measurements {
            match self.buffer.append(&key, measurement) {
                Ok(Some(block)) => closed.push(block),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Measurement rejected");
                }
            }
        }
        if !closed.is_empty() {
            tracing::debug!(blocks = closed.len(), %now, "Closed blocks");
        }
        closed
    }

    /// Close every open block, for shutdown.
    pub fn close_all(&self) -> Vec<Arc<Block>> {
        let closed = self.buffer.close_all();
        tracing::info!(blocks = closed.len(), "Closed all open blocks");
        closed
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

    use chrono::{TimeDelta, TimeZone};
    use ember_types::BlockGrid;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn builder() -> (BlockBuilder, Arc<BufferStore>) {
        let buffer = Arc::new(BufferStore::new(
            BlockGrid::from_secs(50).unwrap(),
            TimeDelta::hours(2),
        ));
        (BlockBuilder::new(Arc::clone(&buffer)), buffer)
    }

    #[test]
    fn vanished_key_closes_on_next_boundary() {
        let (builder, buffer) = builder();
        let gone = ContainerKey::new("gone", "app", "ns");
        let stays = ContainerKey::new("stays", "app", "ns");

        builder.tick(
            at(40),
            vec![
                (gone.clone(), Measurement::new(at(40), 1.0)),
                (stays.clone(), Measurement::new(at(40), 1.0)),
            ],
        );
        let closed = builder.tick(at(50), vec![(stays.clone(), Measurement::new(at(50), 2.0))]);

        let mut keys: Vec<_> = closed.iter().map(|b| b.key().clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![gone.clone(), stays.clone()]);

        builder.tick(at(60), Vec::new());
        assert_eq!(buffer.snapshot(&gone).block_count(), 1);
        assert_eq!(buffer.snapshot(&stays).block_count(), 2);
    }

    #[test]
    fn boundary_measurement_lands_in_next_block() {
        let (builder, buffer) = builder();
        let key = ContainerKey::new("p", "c", "n");
        for s in [30, 40, 50] {
            builder.tick(at(s), vec![(key.clone(), Measurement::new(at(s), 1.0))]);
        }
        let snap = buffer.snapshot(&key);
        assert_eq!(snap.range(at(0), at(50)).len(), 2);
        assert_eq!(snap.range(at(50), at(100)).len(), 1);
    }

    #[test]
    fn close_all_flushes_open_blocks() {
        let (builder, _) = builder();
        let key = ContainerKey::new("p", "c", "n");
        builder.tick(at(10), vec![(key, Measurement::new(at(10), 1.0))]);
        assert_eq!(builder.close_all().len(), 1);
        assert!(builder.close_all().is_empty());
    }
}
