//! Prefill kernel: RoPE + causal QKᵀ + softmax + V, storing
//! rotated K/V into the paged cache as it goes.
//!
//! A production build dispatches one Metal threadgroup per
//! `(batch, seq_len, q_head)` tuple with shared-memory Q/K/score
//! tiles; this function performs the same per-token, per-head math
//! serially, which is semantically identical and is the mandated CPU
//! reference.

use half::f16;
use thiserror::Error;

use crate::kernels::rope::RopeTable;
use crate::kernels::KernelDims;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("page table entry missing for a committed token position")]
    MissingPageTableEntry,
    #[error("dimension mismatch in kernel input")]
    DimensionMismatch,
}

/// One sequence's prefill inputs. `q`/`k`/`v` are
/// `[seq_len, num_heads, head_dim]` row-major (num_q_heads for q,
/// num_kv_heads for k/v), already projected but not yet rotated.
pub struct PrefillInput<'a> {
    pub q: &'a mut [f32],
    pub k: &'a mut [f32],
    pub v: &'a [f32],
    pub seq_len: usize,
    pub position_offset: usize,
    /// Block ids for this sequence, in order; `None` entries are the
    /// `-1` padding sentinel and must never be reached for a committed
    /// position.
    pub page_table: &'a [i64],
}

/// Mutable access to one layer's block-format K/V storage, one block
/// at a time. The Arena hands these out as contiguous per-layer
/// slices (`Arena::k_layer_mut`/`v_layer_mut`); the kernel never sees
/// the full multi-layer block.
pub trait BlockStore {
    fn k_layer_mut(&mut self, block_id: u64) -> &mut [f16];
    fn v_layer_mut(&mut self, block_id: u64) -> &mut [f16];
}

/// Runs the prefill kernel for one sequence, one layer. Returns
/// `context`, `[seq_len, num_q_heads, head_dim]`.
pub fn prefill_attention(
    input: &mut PrefillInput,
    rope: &RopeTable,
    store: &mut impl BlockStore,
    dims: KernelDims,
) -> Result<Vec<f32>, KernelError> {
    let head_dim = dims.head_dim;
    let num_q_heads = dims.num_q_heads;
    let num_kv_heads = dims.num_kv_heads;
    let gqa_group = dims.gqa_group();
    let block_size = dims.block_size;
    let scale = dims.scale();
    let seq_len = input.seq_len;

    if input.q.len() != seq_len * num_q_heads * head_dim
        || input.k.len() != seq_len * num_kv_heads * head_dim
        || input.v.len() != seq_len * num_kv_heads * head_dim
    {
        return Err(KernelError::DimensionMismatch);
    }

    // Step 1: RoPE on q and k in place, per token per head.
    for t in 0..seq_len {
        let abs_pos = t + input.position_offset;
        for h in 0..num_q_heads {
            let start = (t * num_q_heads + h) * head_dim;
            rope.apply(&mut input.q[start..start + head_dim], abs_pos);
        }
        for h in 0..num_kv_heads {
            let start = (t * num_kv_heads + h) * head_dim;
            rope.apply(&mut input.k[start..start + head_dim], abs_pos);
        }
    }

    // Step 2: store rotated K/V into the paged cache.
    for t in 0..seq_len {
        let abs_pos = t + input.position_offset;
        let block_idx = abs_pos / block_size;
        let slot = abs_pos % block_size;
        let block_id = *input
            .page_table
            .get(block_idx)
            .filter(|&&id| id >= 0)
            .ok_or(KernelError::MissingPageTableEntry)? as u64;

        let k_layer = store.k_layer_mut(block_id);
        let v_layer = store.v_layer_mut(block_id);
        for h in 0..num_kv_heads {
            let src_start = (t * num_kv_heads + h) * head_dim;
            let dst_start = (slot * num_kv_heads + h) * head_dim;
            for d in 0..head_dim {
                k_layer[dst_start + d] = f16::from_f32(input.k[src_start + d]);
                v_layer[dst_start + d] = f16::from_f32(input.v[src_start + d]);
            }
        }
    }

    // Step 3/4: causal attention, reading k/v straight from the
    // current prefill window (no cache needed since this is a
    // fresh sequence's first pass — cached history from an earlier
    // chunk would be read through `store` using the same page-table
    // translation as the decode kernel).
    let mut context = vec![0.0f32; seq_len * num_q_heads * head_dim];
    for t in 0..seq_len {
        for h in 0..num_q_heads {
            let kv_head = h / gqa_group.max(1);
            let q_start = (t * num_q_heads + h) * head_dim;
            let q_vec = &input.q[q_start..q_start + head_dim];

            let mut scores = Vec::with_capacity(t + 1);
            let mut max_score = f32::NEG_INFINITY;
            for c in 0..=t {
                let k_start = (c * num_kv_heads + kv_head) * head_dim;
                let k_vec = &input.k[k_start..k_start + head_dim];
                let dot: f32 = q_vec.iter().zip(k_vec).map(|(a, b)| a * b).sum();
                let score = dot * scale;
                scores.push(score);
                if score > max_score {
                    max_score = score;
                }
            }

            let mut denom = 0.0f32;
            for s in scores.iter_mut() {
                *s = (*s - max_score).exp();
                denom += *s;
            }

            let ctx_start = (t * num_q_heads + h) * head_dim;
            for c in 0..=t {
                let weight = scores[c] / denom;
                let v_start = (c * num_kv_heads + kv_head) * head_dim;
                let v_vec = &input.v[v_start..v_start + head_dim];
                for d in 0..head_dim {
                    context[ctx_start + d] += weight * v_vec[d];
                }
            }
        }
    }

    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestStore {
        layers: HashMap<u64, (Vec<f16>, Vec<f16>)>,
        elems_per_layer: usize,
    }

    impl TestStore {
        fn new(elems_per_layer: usize) -> Self {
            Self {
                layers: HashMap::new(),
                elems_per_layer,
            }
        }
    }

    impl BlockStore for TestStore {
        fn k_layer_mut(&mut self, block_id: u64) -> &mut [f16] {
            &mut self
                .layers
                .entry(block_id)
                .or_insert_with(|| {
                    (
                        vec![f16::ZERO; self.elems_per_layer],
                        vec![f16::ZERO; self.elems_per_layer],
                    )
                })
                .0
        }
        fn v_layer_mut(&mut self, block_id: u64) -> &mut [f16] {
            &mut self
                .layers
                .entry(block_id)
                .or_insert_with(|| {
                    (
                        vec![f16::ZERO; self.elems_per_layer],
                        vec![f16::ZERO; self.elems_per_layer],
                    )
                })
                .1
        }
    }

    #[test]
    fn single_token_attends_only_to_itself() {
        let dims = KernelDims {
            num_q_heads: 1,
            num_kv_heads: 1,
            head_dim: 2,
            block_size: 16,
            num_layers: 1,
            layer_idx: 0,
        };
        let rope = RopeTable::new(8, 2, 10000.0);
        let mut q = vec![1.0, 0.0];
        let mut k = vec![1.0, 0.0];
        let v = vec![5.0, 7.0];
        let page_table = vec![0i64];
        let mut input = PrefillInput {
            q: &mut q,
            k: &mut k,
            v: &v,
            seq_len: 1,
            position_offset: 0,
            page_table: &page_table,
        };
        let mut store = TestStore::new(16 * 1 * 2);
        let context = prefill_attention(&mut input, &rope, &mut store, dims).unwrap();
        assert!((context[0] - 5.0).abs() < 1e-4);
        assert!((context[1] - 7.0).abs() < 1e-4);
    }

    #[test]
    fn causal_mask_excludes_future_tokens() {
        let dims = KernelDims {
            num_q_heads: 1,
            num_kv_heads: 1,
            head_dim: 2,
            block_size: 16,
            num_layers: 1,
            layer_idx: 0,
        };
        let rope = RopeTable::new(8, 2, 10000.0);
        // Two tokens; position 0 must not see position 1's value.
        let mut q = vec![1.0, 0.0, 1.0, 0.0];
        let mut k = vec![1.0, 0.0, 1.0, 0.0];
        let v = vec![1.0, 0.0, 100.0, 0.0];
        let page_table = vec![0i64];
        let mut input = PrefillInput {
            q: &mut q,
            k: &mut k,
            v: &v,
            seq_len: 2,
            position_offset: 0,
            page_table: &page_table,
        };
        let mut store = TestStore::new(16 * 1 * 2);
        let context = prefill_attention(&mut input, &rope, &mut store, dims).unwrap();
        // token 0's context must come only from token 0's value (1.0),
        // not token 1's (100.0).
        assert!((context[0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn missing_page_table_entry_errors() {
        let dims = KernelDims {
            num_q_heads: 1,
            num_kv_heads: 1,
            head_dim: 2,
            block_size: 1,
            num_layers: 1,
            layer_idx: 0,
        };
        let rope = RopeTable::new(8, 2, 10000.0);
        let mut q = vec![1.0, 0.0, 1.0, 0.0];
        let mut k = vec![1.0, 0.0, 1.0, 0.0];
        let v = vec![1.0, 0.0, 1.0, 0.0];
        // Only one block for a two-token (two-block, at block_size=1) sequence.
        let page_table = vec![0i64];
        let mut input = PrefillInput {
            q: &mut q,
            k: &mut k,
            v: &v,
            seq_len: 2,
            position_offset: 0,
            page_table: &page_table,
        };
        let mut store = TestStore::new(1 * 1 * 2);
        let err = prefill_attention(&mut input, &rope, &mut store, dims).unwrap_err();
        assert_eq!(err, KernelError::MissingPageTableEntry);
    }
}
