//! Bounded, LSN-indexed ring of recently appended entries.

use std::collections::VecDeque;

use bytes::Bytes;

use super::entry::Lsn;

/// Ring buffer over serialized entries, bounded by both entry count and
/// aggregate byte size. Stored LSNs always form a contiguous `[low, high]`
/// range; eviction always removes the oldest entry.
#[derive(Debug)]
pub struct RingBuffer {
    max_entries: usize,
    max_bytes: usize,
    entries: VecDeque<(Lsn, Bytes)>,
    bytes: usize,
}

impl RingBuffer {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
            entries: VecDeque::new(),
            bytes: 0,
        }
    }

    /// Insert `bytes` at `lsn`, evicting the oldest entries while either
    /// budget is exceeded. `lsn` must be strictly greater than the
    /// previous high-water mark; callers (the journal slice) guarantee this.
    pub fn append(&mut self, lsn: Lsn, bytes: Bytes) {
        self.bytes += bytes.len();
        self.entries.push_back((lsn, bytes));

        while self.entries.len() > self.max_entries.max(1) || self.bytes > self.max_bytes {
            if self.entries.len() <= 1 {
                // Never evict the only entry purely on byte budget; a
                // single oversized entry is still retrievable.
                break;
            }
            if let Some((_, evicted)) = self.entries.pop_front() {
                self.bytes -= evicted.len();
            }
        }
    }

    pub fn contains(&self, lsn: Lsn) -> bool {
        match (self.entries.front(), self.entries.back()) {
            (Some((low, _)), Some((high, _))) => lsn >= *low && lsn <= *high,
            _ => false,
        }
    }

    pub fn get(&self, lsn: Lsn) -> Option<Bytes> {
        if !self.contains(lsn) {
            return None;
        }
        let low = self.entries.front()?.0;
        let idx = (lsn.get() - low.get()) as usize;
        self.entries.get(idx).map(|(_, b)| b.clone())
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}
