//! Ring buffers for session I/O history.
//!
//! [`OutputBuffer`] stores sequenced output entries from a session; when full,
//! the oldest entries are evicted. Waiters are woken via a shared
//! [`Notify`]. [`InputRing`] keeps the most recent input writes for
//! inspection and last-command capture.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::util::now_ms;

/// A single sequenced output entry.
#[derive(Debug, Clone)]
pub struct OutputEntry {
    /// Monotonically increasing sequence number (unique within a session).
    pub seq: u64,
    /// The output data (lossy UTF-8).
    pub data: String,
    /// Unix timestamp in milliseconds when the entry was created.
    pub timestamp_ms: u64,
}

/// Ring buffer of [`OutputEntry`] items with subscriber notification.
pub struct OutputBuffer {
    entries: VecDeque<OutputEntry>,
    next_seq: u64,
    max_entries: usize,
    notify: Arc<Notify>,
}

impl OutputBuffer {
    /// Create a new buffer that holds at most `max_entries` items.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            next_seq: 1,
            max_entries,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Push a new entry, evicting the oldest if full, and notify all waiters.
    pub fn push(&mut self, data: String) {
        let seq = self.next_seq;
        self.next_seq += 1;

        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }

        self.entries.push_back(OutputEntry {
            seq,
            data,
            timestamp_ms: now_ms(),
        });
        self.notify.notify_waiters();
    }

    /// Read all entries with `seq > since`.
    ///
    /// Returns `(entries, dropped_count)` where `dropped_count > 0` if entries
    /// between `since` and the oldest available entry were evicted.
    pub fn read_since(&self, since: u64) -> (Vec<OutputEntry>, u64) {
        let oldest_available = self.entries.front().map_or(self.next_seq, |e| e.seq);
        let dropped = if oldest_available > since.saturating_add(1) {
            oldest_available - since - 1
        } else {
            0
        };

        let entries: Vec<OutputEntry> = self
            .entries
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect();

        (entries, dropped)
    }

    /// Quick check: are there entries with `seq > since`?
    pub fn has_entries_since(&self, since: u64) -> bool {
        self.entries.back().is_some_and(|e| e.seq > since)
    }

    /// Get a clone of the `Arc<Notify>` for external waiting.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Current next sequence number (i.e. number of entries ever pushed + 1).
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bounded ring of recent input writes.
pub struct InputRing {
    entries: VecDeque<String>,
    max_entries: usize,
}

impl InputRing {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(64)),
            max_entries,
        }
    }

    pub fn push(&mut self, data: String) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(data);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_since() {
        let mut buf = OutputBuffer::new(10);
        buf.push("a".to_string());
        buf.push("b".to_string());

        let (entries, dropped) = buf.read_since(0);
        assert_eq!(entries.len(), 2);
        assert_eq!(dropped, 0);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[1].data, "b");

        let (entries, _) = buf.read_since(1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data, "b");
    }

    #[test]
    fn eviction_reports_dropped() {
        let mut buf = OutputBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("{i}"));
        }
        assert_eq!(buf.len(), 3);
        let (entries, dropped) = buf.read_since(0);
        assert_eq!(entries.len(), 3);
        assert_eq!(dropped, 2);
        assert_eq!(entries[0].data, "2");
    }

    #[test]
    fn has_entries_since() {
        let mut buf = OutputBuffer::new(4);
        assert!(!buf.has_entries_since(0));
        buf.push("x".to_string());
        assert!(buf.has_entries_since(0));
        assert!(!buf.has_entries_since(1));
    }

    #[test]
    fn input_ring_caps() {
        let mut ring = InputRing::new(2);
        ring.push("a".to_string());
        ring.push("b".to_string());
        ring.push("c".to_string());
        assert_eq!(ring.len(), 2);
    }
}
