//! Per-key in-memory block store.
//!
//! Each [`ContainerKey`] owns a series: closed blocks (immutable, shared
//! through [`Arc`]) followed by at most one open block. The outer map lock
//! only guards key membership; each series has its own mutex, held for
//! list manipulation only and never across I/O.
//!
//! Readers take a [`SeriesSnapshot`] under the series lock and scan it
//! lock-free, so a block is either fully present or fully absent in what
//! they see, regardless of concurrent closing or eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, TimeDelta, Utc};
use ember_types::{Block, BlockError, BlockGrid, ContainerKey, Measurement};

// ---------------------------------------------------------------------------
// Per-key series
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct KeySeries {
    closed: VecDeque<Arc<Block>>,
    open: Option<Block>,
}

impl KeySeries {
    fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.open.is_none()
    }

    /// Close the open block if `block_end <= now`.
    fn close_if_due(&mut self, now: DateTime<Utc>) -> Option<Arc<Block>> {
        if self.open.as_ref().is_some_and(|b| b.end() <= now) {
            return self.close_open();
        }
        None
    }

    fn close_open(&mut self) -> Option<Arc<Block>> {
        let block = Arc::new(self.open.take()?);
        self.closed.push_back(Arc::clone(&block));
        Some(block)
    }

    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.open
            .as_ref()
            .and_then(|b| b.measurements().last())
            .or_else(|| self.closed.back().and_then(|b| b.measurements().last()))
            .map(|m| m.timestamp)
    }

    /// Append a measurement, opening a block on the grid cell containing
    /// it when needed. Returns a block closed because the measurement
    /// already lies past the open block's end.
    fn append(
        &mut self,
        key: &ContainerKey,
        grid: &BlockGrid,
        measurement: Measurement,
    ) -> Result<Option<Arc<Block>>, BlockError> {
        if let Some(previous) = self.last_timestamp() {
            if measurement.timestamp <= previous {
                return Err(BlockError::NotIncreasing {
                    timestamp: measurement.timestamp,
                    previous,
                });
            }
        }

        let mut closed = None;
        if self
            .open
            .as_ref()
            .is_some_and(|b| measurement.timestamp >= b.end())
        {
            closed = self.close_open();
        }

        match self.open.as_mut() {
            Some(block) => block.push(measurement)?,
            None => {
                let (start, end) = grid.cell(measurement.timestamp);
                let mut block = Block::new(key.clone(), start, end)?;
                block.push(measurement)?;
                self.open = Some(block);
            }
        }
        Ok(closed)
    }

    /// Drop closed blocks ending at or before `cutoff`.
    fn evict(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted: usize = 0;
        while self.closed.front().is_some_and(|b| b.end() <= cutoff) {
            self.closed.pop_front();
            evicted = evicted.saturating_add(1);
        }
        evicted
    }

    fn snapshot(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            closed: self.closed.iter().cloned().collect(),
            open: self.open.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable copy-on-read view of one key's blocks.
#[derive(Debug, Clone, Default)]
pub struct SeriesSnapshot {
    closed: Vec<Arc<Block>>,
    open: Option<Block>,
}

impl SeriesSnapshot {
    fn blocks(&self) -> impl DoubleEndedIterator<Item = &Block> + '_ {
        self.closed.iter().map(AsRef::as_ref).chain(self.open.iter())
    }

    /// Start of the oldest retained block. `None` when nothing is buffered.
    pub fn earliest_start(&self) -> Option<DateTime<Utc>> {
        self.blocks().next().map(Block::start)
    }

    /// Timestamp of the oldest buffered measurement: the seam between
    /// buffered and persisted data.
    ///
    /// Rows flushed before a restart can share the open block's grid cell,
    /// so the seam is the first measurement, not the block start.
    pub fn seam(&self) -> Option<DateTime<Utc>> {
        self.blocks()
            .find_map(|b| b.measurements().first())
            .map(|m| m.timestamp)
    }

    /// Total buffered measurements.
    pub fn len(&self) -> usize {
        self.blocks().map(Block::len).sum()
    }

    /// Whether no measurements are buffered.
    pub fn is_empty(&self) -> bool {
        self.blocks().all(Block::is_empty)
    }

    /// Number of blocks, open one included.
    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    /// The `n` most recent measurements, ascending.
    pub fn last_n(&self, n: usize) -> Vec<Measurement> {
        let mut picked: Vec<Measurement> = self
            .blocks()
            .rev()
            .flat_map(|b| b.measurements().iter().rev())
            .take(n)
            .copied()
            .collect();
        picked.reverse();
        picked
    }

    /// Measurements with `start <= timestamp < end`, ascending.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Measurement> {
        self.blocks()
            .filter(|b| b.overlaps(start, end))
            .flat_map(|b| b.slice(start, end))
            .copied()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory tier holding recent blocks for every key.
#[derive(Debug)]
pub struct BufferStore {
    grid: BlockGrid,
    horizon: TimeDelta,
    series: RwLock<HashMap<ContainerKey, Arc<Mutex<KeySeries>>>>,
}

impl BufferStore {
    /// Create an empty buffer on `grid` that retains closed blocks for
    /// `horizon`.
    pub fn new(grid: BlockGrid, horizon: TimeDelta) -> Self {
        Self {
            grid,
            horizon,
            series: RwLock::new(HashMap::new()),
        }
    }

    /// The block grid.
    pub const fn grid(&self) -> &BlockGrid {
        &self.grid
    }

    /// The retention horizon.
    pub const fn horizon(&self) -> TimeDelta {
        self.horizon
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<ContainerKey, Arc<Mutex<KeySeries>>>> {
        self.series.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<ContainerKey, Arc<Mutex<KeySeries>>>> {
        self.series.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn all_series(&self) -> Vec<Arc<Mutex<KeySeries>>> {
        self.read_map().values().cloned().collect()
    }

    /// Append a measurement to the key's open block.
    ///
    /// Returns the block closed by this append, if the measurement lies
    /// past the open block's end.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::NotIncreasing`] if the measurement is not
    /// strictly after the key's latest one.
    pub fn append(
        &self,
        key: &ContainerKey,
        measurement: Measurement,
    ) -> Result<Option<Arc<Block>>, BlockError> {
        {
            let map = self.read_map();
            if let Some(series) = map.get(key) {
                return lock(series).append(key, &self.grid, measurement);
            }
        }
        let mut map = self.write_map();
        let series = map.entry(key.clone()).or_default();
        lock(series).append(key, &self.grid, measurement)
    }

    /// Close every open block whose end is at or before `now`.
    pub fn close_due(&self, now: DateTime<Utc>) -> Vec<Arc<Block>> {
        self.all_series()
            .iter()
            .filter_map(|series| lock(series).close_if_due(now))
            .collect()
    }

    /// Close every open block regardless of time.
    pub fn close_all(&self) -> Vec<Arc<Block>> {
        self.all_series()
            .iter()
            .filter_map(|series| lock(series).close_open())
            .collect()
    }

    /// Evict closed blocks that ended at or before `now - horizon`.
    ///
    /// Keys left with no blocks are removed. Returns the number of
    /// evicted blocks.
    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.horizon) else {
            return 0;
        };
        let mut map = self.write_map();
        let mut evicted: usize = 0;
        map.retain(|_, series| {
            let mut series = lock(series);
            evicted = evicted.saturating_add(series.evict(cutoff));
            !series.is_empty()
        });
        evicted
    }

    /// Consistent view of one key's blocks.
    pub fn snapshot(&self, key: &ContainerKey) -> SeriesSnapshot {
        let series = self.read_map().get(key).cloned();
        series.map_or_else(SeriesSnapshot::default, |s| lock(&s).snapshot())
    }

    /// The `n` most recent buffered measurements for `key`, ascending.
    pub fn last_n(&self, key: &ContainerKey, n: usize) -> Vec<Measurement> {
        self.snapshot(key).last_n(n)
    }

    /// Buffered measurements for `key` in `[start, end)`, ascending.
    pub fn range(
        &self,
        key: &ContainerKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Measurement> {
        self.snapshot(key).range(start, end)
    }

    /// Buffered keys, sorted.
    pub fn keys(&self) -> Vec<ContainerKey> {
        let mut keys: Vec<ContainerKey> = self.read_map().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total blocks held, open ones included.
    pub fn block_count(&self) -> usize {
        self.all_series()
            .iter()
            .map(|s| {
                let s = lock(s);
                s.closed.len().saturating_add(usize::from(s.open.is_some()))
            })
            .sum()
    }
}

fn lock(series: &Mutex<KeySeries>) -> MutexGuard<'_, KeySeries> {
    series.lock().unwrap_or_else(PoisonError::into_inner)
}
