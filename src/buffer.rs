//! Bounded in-memory reading history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::reading::Reading;

/// Default number of readings kept per source.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Fixed-capacity FIFO of readings in arrival order.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    readings: VecDeque<Reading>,
    capacity: usize,
}

impl Default for RollingBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl RollingBuffer {
    /// Create an empty buffer. A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
        }
    }

    /// Append a reading, evicting the oldest once full.
    pub fn push(&mut self, reading: Reading) {
        if self.readings.len() == self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    pub fn extend<'a>(&mut self, readings: impl IntoIterator<Item = &'a Reading>) {
        for r in readings {
            self.push(*r);
        }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.readings.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter()
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.readings.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }
}

/// Rolling buffers keyed by source (device or patient id).
///
/// Cloning yields another handle to the same store. Reads return copies, so a
/// snapshot is never affected by appends that happen after it was taken.
#[derive(Debug, Clone)]
pub struct ReadingStore {
    inner: Arc<RwLock<HashMap<String, RollingBuffer>>>,
    capacity: usize,
}

impl Default for ReadingStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ReadingStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Append readings for `source`, creating its buffer on first use.
    pub fn append(&self, source: &str, readings: &[Reading]) {
        if readings.is_empty() {
            return;
        }
        let mut map = self.inner.write();
        if !map.contains_key(source) {
            map.insert(source.to_string(), RollingBuffer::with_capacity(self.capacity));
        }
        if let Some(buffer) = map.get_mut(source) {
            buffer.extend(readings);
        }
    }

    pub fn snapshot(&self, source: &str) -> Vec<Reading> {
        self.inner
            .read()
            .get(source)
            .map(RollingBuffer::snapshot)
            .unwrap_or_default()
    }

    pub fn latest(&self, source: &str) -> Option<Reading> {
        self.inner.read().get(source).and_then(|b| b.latest().copied())
    }

    pub fn len(&self, source: &str) -> usize {
        self.inner.read().get(source).map_or(0, RollingBuffer::len)
    }

    /// Empty the buffer for `source`. Returns the number of readings dropped.
    pub fn clear(&self, source: &str) -> usize {
        let mut map = self.inner.write();
        match map.get_mut(source) {
            Some(b) => {
                let n = b.len();
                b.clear();
                n
            }
            None => 0,
        }
    }

    /// Sources that have received at least one reading, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.inner.read().keys().cloned().collect();
        sources.sort();
        sources
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
