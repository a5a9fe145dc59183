//! FIFO reply ordering buffer.
//!
//! Every inbound rpc takes a sequence number in receipt order. Handlers may
//! finish in any order; a completed reply is held until all replies with
//! lower sequence numbers have been released.

use std::collections::BTreeMap;

/// Releases items in sequence-number order.
#[derive(Debug)]
pub struct ReplyOrderer<T> {
    next_seq: u64,
    next_release: u64,
    ready: BTreeMap<u64, T>,
}

impl<T> Default for ReplyOrderer<T> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            next_release: 0,
            ready: BTreeMap::new(),
        }
    }
}

impl<T> ReplyOrderer<T> {
    /// Create empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next sequence number.
    pub fn reserve(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Record a completed item and return everything now releasable, in
    /// order. Unknown or already-released sequence numbers are ignored.
    pub fn complete(&mut self, seq: u64, item: T) -> Vec<T> {
        if seq < self.next_release || seq >= self.next_seq || self.ready.contains_key(&seq) {
            tracing::warn!("Ignoring completion for unexpected sequence {}", seq);
            return Vec::new();
        }
        self.ready.insert(seq, item);

        let mut released = Vec::new();
        while let Some(item) = self.ready.remove(&self.next_release) {
            released.push(item);
            self.next_release += 1;
        }
        released
    }

    /// Reserved but not yet released
    pub fn in_flight(&self) -> u64 {
        self.next_seq - self.next_release
    }

    /// Whether every reserved item has been released
    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Completed items waiting on an earlier one
    pub fn buffered(&self) -> usize {
        self.ready.len()
    }
}
