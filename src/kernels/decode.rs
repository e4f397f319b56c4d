//! Decode kernel: one new token per sequence, paged softmax(QKᵀ)V
//! streamed over the entire cached context.
//!
//! A production build dispatches one Metal threadgroup per
//! `(batch, q_head)` holding running softmax statistics and an
//! on-chip K/V stripe in shared memory; this function streams the
//! same two passes (scores, then weighted V) serially per sequence,
//! which is semantically identical and doubles as the CPU fallback.
//! The caller is responsible for having already appended
//! this step's new token K/V into the cache before calling (the
//! contract explicitly allows either an integrated preamble or a
//! separate store step; this crate uses a separate store via
//! `Pager::append_tokens` + the kernel's own store helper).

use half::f16;

use crate::kernels::KernelDims;

/// Read-only access to one layer's block-format K/V storage.
pub trait BlockStoreRef {
    fn k_layer(&self, block_id: u64) -> &[f16];
    fn v_layer(&self, block_id: u64) -> &[f16];
}

/// One sequence's decode-step inputs. `q` is `[num_q_heads, head_dim]`
/// for the single new token.
pub struct DecodeInput<'a> {
    pub q: &'a [f32],
    pub cached_length: usize,
    pub page_table: &'a [i64],
    pub sliding_window: Option<usize>,
}

/// Runs the decode kernel for one sequence, one layer. Returns
/// `context`, `[num_q_heads, head_dim]`.
pub fn decode_attention(
    input: &DecodeInput,
    store: &impl BlockStoreRef,
    dims: KernelDims,
) -> Vec<f32> {
    let head_dim = dims.head_dim;
    let num_q_heads = dims.num_q_heads;
    let num_kv_heads = dims.num_kv_heads;
    let gqa_group = dims.gqa_group();
    let block_size = dims.block_size;
    let scale = dims.scale();

    let window_start = match input.sliding_window {
        Some(w) if w < input.cached_length => input.cached_length - w,
        _ => 0,
    };

    let mut context = vec![0.0f32; num_q_heads * head_dim];

    for h in 0..num_q_heads {
        let kv_head = h / gqa_group.max(1);
        let q_vec = &input.q[h * head_dim..(h + 1) * head_dim];

        // Pass 1: streaming max + normaliser over all cached positions.
        let mut running_max = f32::NEG_INFINITY;
        let mut running_sum = 0.0f32;
        let mut scores = Vec::with_capacity(input.cached_length - window_start);
        for pos in window_start..input.cached_length {
            let block_idx = pos / block_size;
            let slot = pos % block_size;
            let block_id = input.page_table[block_idx] as u64;
            let k_layer = store.k_layer(block_id);
            let k_start = (slot * num_kv_heads + kv_head) * head_dim;
            let k_vec = &k_layer[k_start..k_start + head_dim];

            let dot: f32 = q_vec
                .iter()
                .zip(k_vec.iter().map(|x| x.to_f32()))
                .map(|(a, b)| a * b)
                .sum();
            let score = dot * scale;
            scores.push(score);

            if score > running_max {
                // Renormalise the running sum for the new max.
                running_sum *= (running_max - score).exp();
                running_max = score;
            }
            running_sum += (score - running_max).exp();
        }

        // Pass 2: weighted V using the final normaliser.
        let ctx_start = h * head_dim;
        for (i, pos) in (window_start..input.cached_length).enumerate() {
            let weight = (scores[i] - running_max).exp() / running_sum;
            let block_idx = pos / block_size;
            let slot = pos % block_size;
            let block_id = input.page_table[block_idx] as u64;
            let v_layer = store.v_layer(block_id);
            let v_start = (slot * num_kv_heads + kv_head) * head_dim;
            for d in 0..head_dim {
                context[ctx_start + d] += weight * v_layer[v_start + d].to_f32();
            }
        }
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestStore {
        layers: HashMap<u64, (Vec<f16>, Vec<f16>)>,
    }

    impl BlockStoreRef for TestStore {
        fn k_layer(&self, block_id: u64) -> &[f16] {
            &self.layers[&block_id].0
        }
        fn v_layer(&self, block_id: u64) -> &[f16] {
            &self.layers[&block_id].1
        }
    }

    fn dims() -> KernelDims {
        KernelDims {
            num_q_heads: 1,
            num_kv_heads: 1,
            head_dim: 2,
            block_size: 4,
            num_layers: 1,
            layer_idx: 0,
        }
    }

    #[test]
    fn single_cached_position_returns_its_value() {
        let mut layers = HashMap::new();
        let mut k = vec![f16::ZERO; 4 * 1 * 2];
        let mut v = vec![f16::ZERO; 4 * 1 * 2];
        k[0] = f16::from_f32(1.0);
        k[1] = f16::from_f32(0.0);
        v[0] = f16::from_f32(3.0);
        v[1] = f16::from_f32(4.0);
        layers.insert(0u64, (k, v));
        let store = TestStore { layers };

        let q = vec![1.0f32, 0.0];
        let page_table = vec![0i64];
        let input = DecodeInput {
            q: &q,
            cached_length: 1,
            page_table: &page_table,
            sliding_window: None,
        };

        let context = decode_attention(&input, &store, dims());
        assert!((context[0] - 3.0).abs() < 1e-2);
        assert!((context[1] - 4.0).abs() < 1e-2);
    }

    #[test]
    fn sliding_window_excludes_old_positions() {
        let mut layers = HashMap::new();
        // block 0: positions 0..4, block 1: position 4
        let mut k0 = vec![f16::ZERO; 4 * 1 * 2];
        let v0 = vec![f16::from_f32(100.0); 4 * 1 * 2];
        // give position 0 a huge score so it would dominate if not windowed out
        k0[0] = f16::from_f32(1000.0);
        layers.insert(0u64, (k0, v0));

        let mut k1 = vec![f16::ZERO; 4 * 1 * 2];
        let mut v1 = vec![f16::ZERO; 4 * 1 * 2];
        k1[0] = f16::from_f32(1.0);
        v1[0] = f16::from_f32(9.0);
        v1[1] = f16::from_f32(9.0);
        layers.insert(1u64, (k1, v1));

        let store = TestStore { layers };
        let q = vec![1.0f32, 0.0];
        let page_table = vec![0i64, 1i64];
        let input = DecodeInput {
            q: &q,
            cached_length: 5,
            page_table: &page_table,
            sliding_window: Some(1),
        };

        let context = decode_attention(&input, &store, dims());
        assert!((context[0] - 9.0).abs() < 1e-2);
    }
}
