//! Non-paged reference attention.
//!
//! Stores K/V as a single growing `Vec<f32>` per sequence instead of
//! fixed-size blocks. Used only to test that the paged kernels agree
//! with an unpaged implementation to within fp16 tolerance; never a
//! production code path.

use crate::kernels::rope::RopeTable;
use crate::kernels::KernelDims;

/// Contiguous K/V cache for one sequence, one layer: `[cached_len, num_kv_heads, head_dim]`.
#[derive(Default)]
pub struct ContiguousCache {
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub len: usize,
}

impl ContiguousCache {
    pub fn append(&mut self, k: &[f32], v: &[f32], num_tokens: usize) {
        self.k.extend_from_slice(k);
        self.v.extend_from_slice(v);
        self.len += num_tokens;
    }
}

/// Runs causal attention for `seq_len` new tokens against `cache`,
/// applying RoPE and appending the new K/V before computing attention
/// exactly as the prefill kernel does, but over a flat cache instead
/// of blocks.
pub fn reference_attention(
    q: &mut [f32],
    k: &mut [f32],
    v: &[f32],
    seq_len: usize,
    position_offset: usize,
    rope: &RopeTable,
    cache: &mut ContiguousCache,
    dims: KernelDims,
) -> Vec<f32> {
    let head_dim = dims.head_dim;
    let num_q_heads = dims.num_q_heads;
    let num_kv_heads = dims.num_kv_heads;
    let gqa_group = dims.gqa_group();
    let scale = dims.scale();

    for t in 0..seq_len {
        let abs_pos = t + position_offset;
        for h in 0..num_q_heads {
            let start = (t * num_q_heads + h) * head_dim;
            rope.apply(&mut q[start..start + head_dim], abs_pos);
        }
        for h in 0..num_kv_heads {
            let start = (t * num_kv_heads + h) * head_dim;
            rope.apply(&mut k[start..start + head_dim], abs_pos);
        }
    }

    cache.append(k, v, seq_len);
    let total_len = cache.len;
    let history_len = total_len - seq_len;

    let mut context = vec![0.0f32; seq_len * num_q_heads * head_dim];
    for t in 0..seq_len {
        let causal_len = history_len + t + 1;
        for h in 0..num_q_heads {
            let kv_head = h / gqa_group.max(1);
            let q_start = (t * num_q_heads + h) * head_dim;
            let q_vec = &q[q_start..q_start + head_dim];

            let mut scores = Vec::with_capacity(causal_len);
            let mut max_score = f32::NEG_INFINITY;
            for c in 0..causal_len {
                let k_start = (c * num_kv_heads + kv_head) * head_dim;
                let k_vec = &cache.k[k_start..k_start + head_dim];
                let dot: f32 = q_vec.iter().zip(k_vec).map(|(a, b)| a * b).sum();
                let score = dot * scale;
                scores.push(score);
                if score > max_score {
                    max_score = score;
                }
            }
            let mut denom = 0.0;
            for s in scores.iter_mut() {
                *s = (*s - max_score).exp();
                denom += *s;
            }
            let ctx_start = (t * num_q_heads + h) * head_dim;
            for c in 0..causal_len {
                let weight = scores[c] / denom;
                let v_start = (c * num_kv_heads + kv_head) * head_dim;
                let v_vec = &cache.v[v_start..v_start + head_dim];
                for d in 0..head_dim {
                    context[ctx_start + d] += weight * v_vec[d];
                }
            }
        }
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_self_attends() {
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
        let mut cache = ContiguousCache::default();
        let context = reference_attention(&mut q, &mut k, &v, 1, 0, &rope, &mut cache, dims);
        assert!((context[0] - 5.0).abs() < 1e-4);
    }
}
