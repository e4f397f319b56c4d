//! Eviction Policy (C3): LRU over sequences, not blocks.
//!
//! Generalized from this crate's old `Evictor`, which ranked individual
//! blocks with a weighted attention/age/tier score and a `BinaryHeap`.
//! That scoring has no counterpart here — there is one tier, and no
//! attention-score signal is tracked — so the heap collapses to a
//! single min-by-`last_touch` scan with a deterministic `seq_id`
//! tie-break. The eviction unit is the whole page table of a victim
//! sequence: evicting individual blocks mid-sequence would corrupt
//! logical token order.

use crate::cache::pager::SeqId;

/// Per-sequence LRU tracking. `last_touch` is the maximum over a
/// sequence's blocks of their Arena `touch` counters; the scheduler
/// updates it whenever the sequence participates in a batch.
#[derive(Debug, Default)]
pub struct Evictor {
    last_touch: std::collections::HashMap<SeqId, u64>,
}

impl Evictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `seq_id` participated in a forward pass at `tick`.
    pub fn on_touch(&mut self, seq_id: SeqId, tick: u64) {
        let entry = self.last_touch.entry(seq_id).or_insert(0);
        if tick > *entry {
            *entry = tick;
        }
    }

    pub fn forget(&mut self, seq_id: SeqId) {
        self.last_touch.remove(&seq_id);
    }

    /// Lowest `last_touch` wins, tied by lowest `seq_id` for
    /// determinism. Candidates must already exclude the currently
    /// executing batch's sequences.
    pub fn choose_victim(&self, candidates: &[SeqId]) -> Option<SeqId> {
        candidates
            .iter()
            .copied()
            .min_by_key(|id| (self.last_touch.get(id).copied().unwrap_or(0), *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn victim_is_least_recently_touched() {
        let mut evictor = Evictor::new();
        evictor.on_touch(1, 10);
        evictor.on_touch(2, 5);
        evictor.on_touch(3, 20);

        assert_eq!(evictor.choose_victim(&[1, 2, 3]), Some(2));
    }

    #[test]
    fn ties_break_on_lowest_seq_id() {
        let mut evictor = Evictor::new();
        evictor.on_touch(5, 1);
        evictor.on_touch(2, 1);

        assert_eq!(evictor.choose_victim(&[5, 2]), Some(2));
    }

    #[test]
    fn untouched_sequences_are_evicted_first() {
        let mut evictor = Evictor::new();
        evictor.on_touch(1, 100);

        assert_eq!(evictor.choose_victim(&[1, 2]), Some(2));
    }

    #[test]
    fn no_candidates_returns_none() {
        let evictor = Evictor::new();
        assert_eq!(evictor.choose_victim(&[]), None);
    }

    #[test]
    fn forget_resets_a_sequences_history() {
        let mut evictor = Evictor::new();
        evictor.on_touch(1, 50);
        evictor.forget(1);
        evictor.on_touch(2, 10);
        // 1 is back to an implicit last_touch of 0, so it is the victim again
        assert_eq!(evictor.choose_victim(&[1, 2]), Some(1));
    }
}
