//! Attention Layer (C5): the per-layer wrapper `ModelForward` invokes.
//!
//! Design Notes calls for collapsing the source's deep class hierarchy
//! (`Attention`, `CachedAttention`, `CachedTransformerBlock`,
//! `CachedLlamaModel`) into a single layer parameterised by a tagged
//! cache handle. [`CacheHandle::Simple`] is the concatenated-cache
//! path kept for parity tests and short sequences; [`CacheHandle::Paged`]
//! is the one production contract.

use half::f16;

use crate::cache::arena::Arena;
use crate::cache::pager::{Pager, SeqId};
use crate::kernels::decode::{decode_attention, BlockStoreRef, DecodeInput};
use crate::kernels::prefill::{prefill_attention, BlockStore, KernelError, PrefillInput};
use crate::kernels::reference::{reference_attention, ContiguousCache};
use crate::kernels::rope::RopeTable;
use crate::kernels::KernelDims;
use crate::model::ops::matmul;

/// Weights for one attention layer's four projections, stored
/// `[out_dim, in_dim]` as `nn.Linear` weights are.
pub struct AttentionWeights {
    pub q_proj: Vec<f16>,
    pub k_proj: Vec<f16>,
    pub v_proj: Vec<f16>,
    pub o_proj: Vec<f16>,
}

/// Tagged cache handle replacing the source's class hierarchy.
pub enum CacheHandle<'a> {
    /// No persistent paged cache: a single growing tensor, not part of
    /// the production contract, kept for correctness parity
    /// tests against the paged path.
    Simple(&'a mut ContiguousCache),
    Paged {
        seq_id: SeqId,
        pager: &'a Pager,
        arena: &'a mut Arena,
    },
}

struct ArenaWriteView<'a> {
    arena: &'a mut Arena,
    layer_idx: usize,
}

impl<'a> BlockStore for ArenaWriteView<'a> {
    fn k_layer_mut(&mut self, block_id: u64) -> &mut [f16] {
        self.arena
            .k_layer_mut(block_id, self.layer_idx)
            .expect("kernel dispatch against an invalid block/layer is a programming error")
    }
    fn v_layer_mut(&mut self, block_id: u64) -> &mut [f16] {
        self.arena
            .v_layer_mut(block_id, self.layer_idx)
            .expect("kernel dispatch against an invalid block/layer is a programming error")
    }
}

struct ArenaReadView<'a> {
    arena: &'a Arena,
    layer_idx: usize,
}

impl<'a> BlockStoreRef for ArenaReadView<'a> {
    fn k_layer(&self, block_id: u64) -> &[f16] {
        self.arena
            .k_layer(block_id, self.layer_idx)
            .expect("kernel dispatch against an invalid block/layer is a programming error")
    }
    fn v_layer(&self, block_id: u64) -> &[f16] {
        self.arena
            .v_layer(block_id, self.layer_idx)
            .expect("kernel dispatch against an invalid block/layer is a programming error")
    }
}

pub struct AttentionLayer {
    pub layer_idx: usize,
    pub weights: AttentionWeights,
}

impl AttentionLayer {
    /// `x` is `[seq_len, hidden]`. Returns `[seq_len, hidden]` after
    /// the output projection. `seq_len == 1` is a decode step,
    /// `seq_len > 1` is prefill.
    pub fn forward(
        &self,
        x: &[f32],
        seq_len: usize,
        hidden: usize,
        start_position: usize,
        cache: CacheHandle,
        rope: &RopeTable,
        dims: KernelDims,
        sliding_window: Option<usize>,
    ) -> Result<Vec<f32>, KernelError> {
        let q_dim = dims.num_q_heads * dims.head_dim;
        let kv_dim = dims.num_kv_heads * dims.head_dim;

        let mut q = matmul(x, seq_len, hidden, &self.weights.q_proj, q_dim);
        let mut k = matmul(x, seq_len, hidden, &self.weights.k_proj, kv_dim);
        let v = matmul(x, seq_len, hidden, &self.weights.v_proj, kv_dim);

        let context = match cache {
            CacheHandle::Simple(contiguous) => reference_attention(
                &mut q,
                &mut k,
                &v,
                seq_len,
                start_position,
                rope,
                contiguous,
                dims,
            ),
            CacheHandle::Paged {
                seq_id,
                pager,
                arena,
            } => {
                if seq_len > 1 {
                    let page_table = pager.page_table(seq_id, pager_width(pager, seq_id, dims))
                        .expect("seq_id must be a live sequence already admitted by the Pager");
                    let mut input = PrefillInput {
                        q: &mut q,
                        k: &mut k,
                        v: &v,
                        seq_len,
                        position_offset: start_position,
                        page_table: &page_table,
                    };
                    let mut store = ArenaWriteView {
                        arena,
                        layer_idx: self.layer_idx,
                    };
                    prefill_attention(&mut input, rope, &mut store, dims)?
                } else {
                    let cached_length = pager
                        .cached_length(seq_id)
                        .expect("seq_id must be a live sequence already admitted by the Pager");
                    let position = cached_length - 1;
                    let page_table = pager.page_table(seq_id, pager_width(pager, seq_id, dims))
                        .expect("seq_id must be a live sequence already admitted by the Pager");
                    let (block_id, slot) = pager
                        .locate(seq_id, position)
                        .expect("the Pager must have allocated a block for the new token");

                    for h in 0..dims.num_q_heads {
                        let start = h * dims.head_dim;
                        rope.apply(&mut q[start..start + dims.head_dim], position);
                    }
                    for h in 0..dims.num_kv_heads {
                        let start = h * dims.head_dim;
                        rope.apply(&mut k[start..start + dims.head_dim], position);
                    }

                    {
                        let mut store = ArenaWriteView {
                            arena: &mut *arena,
                            layer_idx: self.layer_idx,
                        };
                        let k_layer = store.k_layer_mut(block_id);
                        let v_layer = store.v_layer_mut(block_id);
                        for h in 0..dims.num_kv_heads {
                            let src = h * dims.head_dim;
                            let dst = (slot * dims.num_kv_heads + h) * dims.head_dim;
                            for d in 0..dims.head_dim {
                                k_layer[dst + d] = f16::from_f32(k[src + d]);
                                v_layer[dst + d] = f16::from_f32(v[src + d]);
                            }
                        }
                    }

                    let read = ArenaReadView {
                        arena,
                        layer_idx: self.layer_idx,
                    };
                    let input = DecodeInput {
                        q: &q,
                        cached_length,
                        page_table: &page_table,
                        sliding_window,
                    };
                    decode_attention(&input, &read, dims)
                }
            }
        };

        Ok(matmul(&context, seq_len, q_dim, &self.weights.o_proj, hidden))
    }
}

fn pager_width(pager: &Pager, seq_id: SeqId, dims: KernelDims) -> usize {
    let cached = pager.cached_length(seq_id).unwrap_or(0);
    let block_size = dims.block_size.max(1);
    (cached + block_size - 1) / block_size
}
