//! The pending-result queue.
//!
//! Every item accepted into the engine gets an entry at the back. Every result
//! the engine emits consumes the entry at the front. Entries still queued at
//! close belong to items the operation dropped.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::time::Instant;

/// One accepted item awaiting a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    /// Acceptance order, starting at 0.
    pub seq: u64,
    /// When the item was accepted.
    pub accepted_at: Instant,
}

/// FIFO correlating accepted items with emitted results.
#[derive(Debug, Default)]
pub struct PendingResults {
    queue: VecDeque<PendingEntry>,
    next_seq: u64,
    resolved: u64,
    discarded: u64,
}

impl PendingResults {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted item. Returns its sequence number.
    pub fn enqueue(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(PendingEntry {
            seq,
            accepted_at: Instant::now(),
        });
        seq
    }

    /// Consume the oldest entry for an emitted result.
    ///
    /// An empty queue means the engine produced more results than it was
    /// given items, which is an [`Error::OrderingViolation`].
    pub fn resolve(&mut self) -> Result<PendingEntry> {
        let entry = self.queue.pop_front().ok_or_else(|| {
            Error::OrderingViolation(format!(
                "result emitted with no pending entry ({} accepted, {} resolved)",
                self.next_seq, self.resolved
            ))
        })?;
        self.resolved += 1;
        Ok(entry)
    }

    /// Drop every remaining entry. Returns how many were dropped.
    pub fn discard_remaining(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        self.discarded += n as u64;
        n
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total items accepted.
    pub fn accepted(&self) -> u64 {
        self.next_seq
    }

    /// Total entries consumed by results.
    pub fn resolved(&self) -> u64 {
        self.resolved
    }

    /// Total entries discarded at close.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_from_front() {
        let mut queue = PendingResults::new();
        assert_eq!(queue.enqueue(), 0);
        assert_eq!(queue.enqueue(), 1);
        assert_eq!(queue.enqueue(), 2);

        assert_eq!(queue.resolve().unwrap().seq, 0);
        assert_eq!(queue.resolve().unwrap().seq, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_underflow_is_ordering_violation() {
        let mut queue = PendingResults::new();
        queue.enqueue();
        queue.resolve().unwrap();

        let err = queue.resolve().unwrap_err();
        assert!(matches!(err, Error::OrderingViolation(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_discard_counts_leftovers() {
        let mut queue = PendingResults::new();
        for _ in 0..4 {
            queue.enqueue();
        }
        queue.resolve().unwrap();
        queue.resolve().unwrap();

        assert_eq!(queue.discard_remaining(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.accepted(), 4);
        assert_eq!(queue.resolved(), 2);
        assert_eq!(queue.discarded(), 2);
        assert_eq!(queue.discard_remaining(), 0);
    }
}
