//! Block Arena (C1): owns all KV tensor storage, hands out fixed blocks
//! by id, and provides zero-copy references to block storage for kernel
//! dispatch.
//!
//! Generalized from the free-list VRAM allocator this crate used to
//! hand out byte offsets per GPU device: here the Arena owns the
//! tensors directly rather than offsets into someone else's
//! allocation, since there is only one tier of storage left to manage.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::cache::block::{new_block_id, Block, BlockId, BlockShape};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena is out of free blocks")]
    OutOfBlocks,

    #[error("block {0} is not currently allocated")]
    InvalidBlock(BlockId),

    #[error("layer index {0} out of range")]
    InvalidLayer(usize),
}

/// Owns the contiguous K/V tensor storage for every block the engine
/// will ever hand out, plus the free list.
pub struct Arena {
    shape: BlockShape,
    blocks: Vec<Block>,
    /// Maps a BlockId to its index in `blocks`. BlockIds are allocated
    /// once at construction and never reused across Arenas, but we key
    /// by index for O(1) access since ids are dense and start at zero
    /// relative to this Arena's own counter.
    free_list: VecDeque<BlockId>,
    index: HashMap<BlockId, usize>,
    capacity: usize,
    tick: u64,
}

impl Arena {
    /// Construct an Arena with `capacity` blocks of the given shape.
    /// All blocks start on the free list.
    pub fn new(capacity: usize, shape: BlockShape) -> Self {
        let mut blocks = Vec::with_capacity(capacity);
        let mut free_list = VecDeque::with_capacity(capacity);
        let mut index = HashMap::with_capacity(capacity);
        for i in 0..capacity {
            let id = new_block_id();
            blocks.push(Block::new(id, &shape));
            free_list.push_back(id);
            index.insert(id, i);
        }
        Self {
            shape,
            blocks,
            free_list,
            index,
            capacity,
            tick: 0,
        }
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    /// O(1) allocate off the free list.
    pub fn allocate(&mut self) -> Result<BlockId, ArenaError> {
        self.free_list.pop_front().ok_or(ArenaError::OutOfBlocks)
    }

    /// Return a block to the free list. Idempotent failure (returns
    /// `InvalidBlock`) if the id does not correspond to a currently
    /// allocated block.
    pub fn free(&mut self, block_id: BlockId) -> Result<(), ArenaError> {
        if self.free_list.contains(&block_id) {
            return Err(ArenaError::InvalidBlock(block_id));
        }
        self.index_of(block_id)?;
        self.free_list.push_back(block_id);
        debug!(block_id, "freed block");
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bump the touch counter for eviction accounting.
    pub fn touch(&mut self, block_id: BlockId) -> Result<(), ArenaError> {
        self.tick += 1;
        let tick = self.tick;
        let idx = self.index_of(block_id)?;
        self.blocks[idx].last_touch = tick;
        Ok(())
    }

    pub fn last_touch(&self, block_id: BlockId) -> Result<u64, ArenaError> {
        let idx = self.index_of(block_id)?;
        Ok(self.blocks[idx].last_touch)
    }

    /// Reference to one layer's K slice for a block. No copy.
    pub fn k_layer(&self, block_id: BlockId, layer_idx: usize) -> Result<&[half::f16], ArenaError> {
        let idx = self.index_of(block_id)?;
        self.layer_slice(&self.blocks[idx].k, layer_idx)
    }

    pub fn v_layer(&self, block_id: BlockId, layer_idx: usize) -> Result<&[half::f16], ArenaError> {
        let idx = self.index_of(block_id)?;
        self.layer_slice(&self.blocks[idx].v, layer_idx)
    }

    pub fn k_layer_mut(
        &mut self,
        block_id: BlockId,
        layer_idx: usize,
    ) -> Result<&mut [half::f16], ArenaError> {
        let idx = self.index_of(block_id)?;
        let per_layer = self.shape.elems_per_layer();
        let num_layers = self.shape.num_layers;
        Self::layer_slice_mut(&mut self.blocks[idx].k, layer_idx, per_layer, num_layers)
    }

    pub fn v_layer_mut(
        &mut self,
        block_id: BlockId,
        layer_idx: usize,
    ) -> Result<&mut [half::f16], ArenaError> {
        let idx = self.index_of(block_id)?;
        let per_layer = self.shape.elems_per_layer();
        let num_layers = self.shape.num_layers;
        Self::layer_slice_mut(&mut self.blocks[idx].v, layer_idx, per_layer, num_layers)
    }

    /// Full K tensor for a block, shape `[num_layers, block_size, num_kv_heads, head_dim]`.
    pub fn k_block(&self, block_id: BlockId) -> Result<&[half::f16], ArenaError> {
        let idx = self.index_of(block_id)?;
        Ok(&self.blocks[idx].k)
    }

    pub fn v_block(&self, block_id: BlockId) -> Result<&[half::f16], ArenaError> {
        let idx = self.index_of(block_id)?;
        Ok(&self.blocks[idx].v)
    }

    /// Batch form of [`Arena::k_block`] for dispatching a kernel over
    /// every block in a page table at once.
    pub fn k_blocks(&self, block_ids: &[BlockId]) -> Result<Vec<&[half::f16]>, ArenaError> {
        block_ids.iter().map(|&id| self.k_block(id)).collect()
    }

    /// Batch form of [`Arena::v_block`].
    pub fn v_blocks(&self, block_ids: &[BlockId]) -> Result<Vec<&[half::f16]>, ArenaError> {
        block_ids.iter().map(|&id| self.v_block(id)).collect()
    }

    fn index_of(&self, block_id: BlockId) -> Result<usize, ArenaError> {
        self.index
            .get(&block_id)
            .copied()
            .ok_or(ArenaError::InvalidBlock(block_id))
    }

    fn layer_slice<'a>(
        &self,
        tensor: &'a [half::f16],
        layer_idx: usize,
    ) -> Result<&'a [half::f16], ArenaError> {
        if layer_idx >= self.shape.num_layers {
            return Err(ArenaError::InvalidLayer(layer_idx));
        }
        let per_layer = self.shape.elems_per_layer();
        let start = layer_idx * per_layer;
        Ok(&tensor[start..start + per_layer])
    }

    fn layer_slice_mut(
        tensor: &mut [half::f16],
        layer_idx: usize,
        per_layer: usize,
        num_layers: usize,
    ) -> Result<&mut [half::f16], ArenaError> {
        if layer_idx >= num_layers {
            return Err(ArenaError::InvalidLayer(layer_idx));
        }
        let start = layer_idx * per_layer;
        Ok(&mut tensor[start..start + per_layer])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shape() -> BlockShape {
        BlockShape {
            num_layers: 2,
            block_size: 16,
            num_kv_heads: 2,
            head_dim: 8,
        }
    }

    #[test]
    fn allocate_and_free_round_trips() {
        let mut arena = Arena::new(4, test_shape());
        assert_eq!(arena.free_count(), 4);

        let a = arena.allocate().unwrap();
        let b = arena.allocate().unwrap();
        assert_eq!(arena.free_count(), 2);

        arena.free(a).unwrap();
        arena.free(b).unwrap();
        assert_eq!(arena.free_count(), 4);
    }

    #[test]
    fn exhausting_capacity_returns_out_of_blocks() {
        let mut arena = Arena::new(1, test_shape());
        arena.allocate().unwrap();
        assert_eq!(arena.allocate().unwrap_err(), ArenaError::OutOfBlocks);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut arena = Arena::new(1, test_shape());
        let id = arena.allocate().unwrap();
        arena.free(id).unwrap();
        assert_eq!(arena.free(id).unwrap_err(), ArenaError::InvalidBlock(id));
    }

    #[test]
    fn layer_slices_are_disjoint_and_zero_copy() {
        let mut arena = Arena::new(1, test_shape());
        let id = arena.allocate().unwrap();

        {
            let layer0 = arena.k_layer_mut(id, 0).unwrap();
            layer0[0] = half::f16::from_f32(1.0);
        }
        {
            let layer1 = arena.k_layer_mut(id, 1).unwrap();
            assert_eq!(layer1[0], half::f16::ZERO);
        }
        assert_eq!(arena.k_layer(id, 0).unwrap()[0], half::f16::from_f32(1.0));
    }

    #[test]
    fn batch_block_lookup_matches_per_block_lookup() {
        let mut arena = Arena::new(2, test_shape());
        let a = arena.allocate().unwrap();
        let b = arena.allocate().unwrap();
        arena.k_layer_mut(a, 0).unwrap()[0] = half::f16::from_f32(1.0);
        arena.k_layer_mut(b, 0).unwrap()[0] = half::f16::from_f32(2.0);

        let blocks = arena.k_blocks(&[a, b]).unwrap();
        assert_eq!(blocks[0], arena.k_block(a).unwrap());
        assert_eq!(blocks[1], arena.k_block(b).unwrap());

        assert_eq!(
            arena.v_blocks(&[a, b]).unwrap(),
            vec![arena.v_block(a).unwrap(), arena.v_block(b).unwrap()]
        );
    }

    #[test]
    fn batch_block_lookup_propagates_invalid_block() {
        let arena = Arena::new(1, test_shape());
        let bogus = 9999;
        assert_eq!(
            arena.k_blocks(&[bogus]).unwrap_err(),
            ArenaError::InvalidBlock(bogus)
        );
    }

    #[test]
    fn touch_bumps_last_touch_monotonically() {
        let mut arena = Arena::new(2, test_shape());
        let a = arena.allocate().unwrap();
        let b = arena.allocate().unwrap();

        arena.touch(a).unwrap();
        let t1 = arena.last_touch(a).unwrap();
        arena.touch(b).unwrap();
        let t2 = arena.last_touch(b).unwrap();
        assert!(t2 > t1);
    }
}
