//! Pager (C2): per-sequence page tables over the Block Arena.
//!
//! Generalized from this crate's old tier manager, which owned block
//! storage directly in a `HashMap<BlockId, KvBlock>` alongside
//! per-sequence block tables. That coupling is gone: the Pager holds
//! only `BlockId`s, and every call that allocates or frees takes
//! `&mut Arena` explicitly, per the arena-plus-integer-handles design.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::cache::arena::{Arena, ArenaError};
use crate::cache::block::BlockId;

pub type SeqId = u64;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerError {
    #[error("sequence {0} does not exist")]
    UnknownSequence(SeqId),

    #[error("sequence would exceed max_position")]
    MaxPosition,

    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// A logical request's ordered page table plus bookkeeping.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub seq_id: SeqId,
    pub page_table: Vec<BlockId>,
    pub cached_length: usize,
    pub max_position: usize,
}

impl Sequence {
    fn blocks_needed(&self, block_size: usize) -> usize {
        (self.cached_length + block_size - 1) / block_size.max(1)
    }
}

/// Maps `seq_id -> Sequence`; owns sequence lifecycles.
pub struct Pager {
    block_size: usize,
    sequences: HashMap<SeqId, Sequence>,
    next_seq_id: SeqId,
}

impl Pager {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            sequences: HashMap::new(),
            next_seq_id: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocate an empty Sequence, returning its `seq_id`.
    pub fn new_sequence(&mut self, max_position: usize) -> SeqId {
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        self.sequences.insert(
            seq_id,
            Sequence {
                seq_id,
                page_table: Vec::new(),
                cached_length: 0,
                max_position,
            },
        );
        seq_id
    }

    /// Return every block in the page table to the Arena; remove the
    /// Sequence. Idempotent on double call.
    pub fn destroy_sequence(&mut self, seq_id: SeqId, arena: &mut Arena) {
        if let Some(seq) = self.sequences.remove(&seq_id) {
            for block_id in seq.page_table {
                // A block may already be gone if the caller freed it
                // out of band; that's not our problem to report here.
                let _ = arena.free(block_id);
            }
            debug!(seq_id, "destroyed sequence");
        }
    }

    pub fn cached_length(&self, seq_id: SeqId) -> Result<usize, PagerError> {
        self.get(seq_id).map(|s| s.cached_length)
    }

    pub fn max_position(&self, seq_id: SeqId) -> Result<usize, PagerError> {
        self.get(seq_id).map(|s| s.max_position)
    }

    /// Extend the logical length by `n`, allocating fresh blocks as
    /// needed. Atomic: on `ErrOutOfBlocks` any blocks allocated by this
    /// call are freed before return.
    pub fn append_tokens(
        &mut self,
        seq_id: SeqId,
        n: usize,
        arena: &mut Arena,
    ) -> Result<(), PagerError> {
        if n == 0 {
            return Ok(());
        }
        let block_size = self.block_size;
        let seq = self
            .sequences
            .get_mut(&seq_id)
            .ok_or(PagerError::UnknownSequence(seq_id))?;

        let new_length = seq.cached_length + n;
        if new_length > seq.max_position {
            return Err(PagerError::MaxPosition);
        }

        let blocks_needed = (new_length + block_size - 1) / block_size;
        let mut allocated = Vec::new();
        while seq.page_table.len() < blocks_needed {
            match arena.allocate() {
                Ok(id) => {
                    seq.page_table.push(id);
                    allocated.push(id);
                }
                Err(e) => {
                    // Roll back: free everything this call allocated.
                    for id in allocated {
                        seq.page_table.pop();
                        let _ = arena.free(id);
                    }
                    return Err(PagerError::Arena(e));
                }
            }
        }

        seq.cached_length = new_length;
        Ok(())
    }

    /// Page table zero-padded (sentinel `-1`) to `pad_to` entries,
    /// suitable for direct use as a kernel argument buffer.
    pub fn page_table(&self, seq_id: SeqId, pad_to: usize) -> Result<Vec<i64>, PagerError> {
        let seq = self.get(seq_id)?;
        let mut out: Vec<i64> = seq.page_table.iter().map(|&id| id as i64).collect();
        out.resize(pad_to, -1);
        Ok(out)
    }

    /// Pure translation: token position -> (block_id, slot_in_block).
    pub fn locate(&self, seq_id: SeqId, position: usize) -> Result<(BlockId, usize), PagerError> {
        let seq = self.get(seq_id)?;
        let block_idx = position / self.block_size;
        let slot = position % self.block_size;
        let block_id = *seq
            .page_table
            .get(block_idx)
            .ok_or(PagerError::MaxPosition)?;
        Ok((block_id, slot))
    }

    /// Shrink `cached_length`, freeing blocks whose entire token range
    /// is discarded.
    pub fn truncate(
        &mut self,
        seq_id: SeqId,
        new_length: usize,
        arena: &mut Arena,
    ) -> Result<(), PagerError> {
        let block_size = self.block_size;
        let seq = self
            .sequences
            .get_mut(&seq_id)
            .ok_or(PagerError::UnknownSequence(seq_id))?;

        if new_length >= seq.cached_length {
            return Ok(());
        }
        seq.cached_length = new_length;
        let keep_blocks = seq.blocks_needed(block_size);
        while seq.page_table.len() > keep_blocks {
            if let Some(id) = seq.page_table.pop() {
                let _ = arena.free(id);
            }
        }
        Ok(())
    }

    /// Whether the Arena currently has at least `blocks_needed` free
    /// blocks. Used by the scheduler's admission check; the
    /// Pager never reaches into the Arena on its own initiative
    /// outside of `append_tokens`/`truncate`/`destroy_sequence`.
    pub fn can_allocate(&self, blocks_needed: usize, arena: &Arena) -> bool {
        arena.free_count() >= blocks_needed
    }

    pub fn contains(&self, seq_id: SeqId) -> bool {
        self.sequences.contains_key(&seq_id)
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    fn get(&self, seq_id: SeqId) -> Result<&Sequence, PagerError> {
        self.sequences
            .get(&seq_id)
            .ok_or(PagerError::UnknownSequence(seq_id))
    }
}
