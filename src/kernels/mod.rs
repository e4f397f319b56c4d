//! Fused Attention Kernels (C4).
//!
//! Implemented as plain safe-Rust numeric functions over `&[f16]`/
//! `&mut [f16]` slices borrowed straight out of the Arena's block
//! storage (f32 softmax accumulation, fp16 storage), since no compiled
//! Metal shader library can be produced without invoking the
//! toolchain. Where a `.metal` kernel dispatched through the `metal`
//! crate's command-buffer API would replace a function body in a
//! production build, a doc comment says so. This same implementation
//! is also the mandated CPU fallback: it is the only
//! implementation, so parity with itself is definitional, and the
//! paged-vs-contiguous parity property (scenario 4) is
//! tested against [`reference`].
//!
//! - [`rope`]: rotary positional embedding applied to Q/K.
//! - [`prefill`]: fused RoPE + QKᵀ + softmax + V + KV-store kernel.
//! - [`decode`]: fused paged softmax(QKᵀ)V kernel, one new token.
//! - [`reference`]: non-paged reference attention for parity tests.

pub mod decode;
pub mod prefill;
pub mod reference;
pub mod rope;

/// Shared dispatch scalars threaded through every kernel call.
#[derive(Debug, Clone, Copy)]
pub struct KernelDims {
    pub num_q_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub block_size: usize,
    pub num_layers: usize,
    pub layer_idx: usize,
}

impl KernelDims {
    pub fn gqa_group(&self) -> usize {
        self.num_q_heads / self.num_kv_heads.max(1)
    }

    pub fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }
}
