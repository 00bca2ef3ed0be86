//! Bounded recent-history buffer.
//!
//! Newest-first sequence of accepted [`Telemetry`] records with a fixed
//! capacity. Two insertion policies exist:
//!
//! - [`HistoryMode::Stream`]: streamed frames are trusted to be monotonic, so
//!   every record is prepended and the oldest is evicted on overflow.
//! - [`HistoryMode::PollMerge`]: polled snapshots may overlap in time, so
//!   records are de-duplicated by `(device_id, device_timestamp)`. The first
//!   record seen for a key is kept; later duplicates are dropped.
//!
//! Records are shared as `Arc<Telemetry>` and never mutated after insertion.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::telemetry::Telemetry;

/// Default capacity of the history buffer.
pub const MAX_HISTORY: usize = 25;

/// Insertion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMode {
    /// Prepend everything, evict oldest.
    Stream,
    /// Prepend with de-duplication, first-seen wins.
    PollMerge,
}

/// Bounded, newest-first telemetry history.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    records: VecDeque<Arc<Telemetry>>,
    capacity: usize,
    mode: HistoryMode,
}

impl HistoryBuffer {
    /// Create an empty buffer.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize, mode: HistoryMode) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity + 1),
            capacity,
            mode,
        }
    }

    /// Stream-mode buffer with [`MAX_HISTORY`] capacity.
    #[must_use]
    pub fn stream() -> Self {
        Self::new(MAX_HISTORY, HistoryMode::Stream)
    }

    /// Poll-merge buffer with [`MAX_HISTORY`] capacity.
    #[must_use]
    pub fn poll_merge() -> Self {
        Self::new(MAX_HISTORY, HistoryMode::PollMerge)
    }

    /// Insert a record at the front.
    ///
    /// Returns `false` if the record was dropped as a duplicate (poll-merge
    /// mode only).
    pub fn push(&mut self, record: impl Into<Arc<Telemetry>>) -> bool {
        let record = record.into();
        match self.mode {
            HistoryMode::Stream => {
                self.records.push_front(record);
                while self.records.len() > self.capacity {
                    self.records.pop_back();
                }
                true
            }
            HistoryMode::PollMerge => self.merge(record),
        }
    }

    fn merge(&mut self, record: Arc<Telemetry>) -> bool {
        let key = record.dedup_key();
        if self.records.iter().any(|existing| existing.dedup_key() == key) {
            tracing::trace!(device_id = %record.device_id, "Dropping duplicate polled record");
            return false;
        }

        // Keys already held are unique, so prepending keeps them unique.
        self.records.push_front(record);
        self.records.truncate(self.capacity);
        true
    }

    /// Newest accepted record.
    #[must_use]
    pub fn latest(&self) -> Option<&Arc<Telemetry>> {
        self.records.front()
    }

    /// Remove all records.
    pub fn reset(&mut self) {
        self.records.clear();
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Maximum number of records held.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insertion policy of this buffer.
    #[must_use]
    pub fn mode(&self) -> HistoryMode {
        self.mode
    }

    /// Iterate newest-first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Telemetry>> {
        self.records.iter()
    }

    /// Copy of the current contents, newest-first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Arc<Telemetry>> {
        self.records.iter().cloned().collect()
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::stream()
    }
}
