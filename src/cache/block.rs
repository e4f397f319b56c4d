//! Block shape and identity.
//!
//! A block is a fixed-size tile of KV storage: `block_size` contiguous
//! token slots, across every layer and every KV head. Blocks are the
//! unit the Arena allocates, frees, and hands out zero-copy references
//! to; they carry no tiering or format metadata, unlike their ancestor.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a KV block within one Arena.
pub type BlockId = u64;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a new unique block ID.
pub fn new_block_id() -> BlockId {
    NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Logical shape shared by every block in an Arena.
///
/// K and V each have layout `[num_layers, block_size, num_kv_heads, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockShape {
    pub num_layers: usize,
    pub block_size: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl BlockShape {
    /// Elements in one layer's K (or V) slice for this block.
    pub fn elems_per_layer(&self) -> usize {
        self.block_size * self.num_kv_heads * self.head_dim
    }

    /// Elements in the full K (or V) tensor for this block, across all layers.
    pub fn elems_per_block(&self) -> usize {
        self.num_layers * self.elems_per_layer()
    }

    /// Elements covering one token's K (or V) for a single KV head.
    pub fn elems_per_head(&self) -> usize {
        self.head_dim
    }
}

/// One block's backing storage. Owned exclusively by the Arena; never
/// referenced by more than one live sequence at a time.
#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub k: Vec<half::f16>,
    pub v: Vec<half::f16>,
    /// Monotonic tick of the last forward pass that touched this block.
    pub last_touch: u64,
}

impl Block {
    pub fn new(id: BlockId, shape: &BlockShape) -> Self {
        let n = shape.elems_per_block();
        Self {
            id,
            k: vec![half::f16::ZERO; n],
            v: vec![half::f16::ZERO; n],
            last_touch: 0,
        }
    }
}
