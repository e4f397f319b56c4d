//! Non-attention fused ops: RMSNorm, SwiGLU MLP, and the matmul used
//! for every projection. These are plain dense-math building blocks
//! that don't touch the paged cache.
//!
//! Plain f32 compute over weights read through [`crate::collaborators::WeightSource`]
//! (fp16-stored, promoted on read). A production build dispatches
//! these as their own fused Metal kernels (quantised matmul included);
//! the contract here — shapes in, shapes out — is what that dispatch
//! must preserve.

use half::f16;

/// Row-major `x [rows, k]` times `weight^T` where `weight` is stored
/// `[out_dim, k]` (the usual nn.Linear layout) -> `[rows, out_dim]`.
pub fn matmul(x: &[f32], rows: usize, k: usize, weight: &[f16], out_dim: usize) -> Vec<f32> {
    debug_assert_eq!(x.len(), rows * k);
    debug_assert_eq!(weight.len(), out_dim * k);
    let mut out = vec![0.0f32; rows * out_dim];
    for r in 0..rows {
        let x_row = &x[r * k..(r + 1) * k];
        for o in 0..out_dim {
            let w_row = &weight[o * k..(o + 1) * k];
            let mut acc = 0.0f32;
            for i in 0..k {
                acc += x_row[i] * w_row[i].to_f32();
            }
            out[r * out_dim + o] = acc;
        }
    }
    out
}

/// RMSNorm over the last dimension: `x / rms(x) * weight`.
pub fn rms_norm(x: &[f32], rows: usize, dim: usize, weight: &[f16], eps: f32) -> Vec<f32> {
    debug_assert_eq!(x.len(), rows * dim);
    let mut out = vec![0.0f32; rows * dim];
    for r in 0..rows {
        let row = &x[r * dim..(r + 1) * dim];
        let mean_sq: f32 = row.iter().map(|v| v * v).sum::<f32>() / dim as f32;
        let inv_rms = 1.0 / (mean_sq + eps).sqrt();
        for d in 0..dim {
            out[r * dim + d] = row[d] * inv_rms * weight[d].to_f32();
        }
    }
    out
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// SwiGLU feed-forward: `down(silu(gate(x)) * up(x))`.
pub fn swiglu_mlp(
    x: &[f32],
    rows: usize,
    hidden: usize,
    intermediate: usize,
    gate_weight: &[f16],
    up_weight: &[f16],
    down_weight: &[f16],
) -> Vec<f32> {
    let gate = matmul(x, rows, hidden, gate_weight, intermediate);
    let up = matmul(x, rows, hidden, up_weight, intermediate);
    let mut activated = vec![0.0f32; rows * intermediate];
    for i in 0..activated.len() {
        activated[i] = silu(gate[i]) * up[i];
    }
    matmul(&activated, rows, intermediate, down_weight, hidden)
}

/// Elementwise residual add, `a + b`, same shape.
pub fn add_residual(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f16v(v: &[f32]) -> Vec<f16> {
        v.iter().map(|x| f16::from_f32(*x)).collect()
    }

    #[test]
    fn matmul_identity_weight_passes_through() {
        // 2x2 identity weight: out == x
        let weight = f16v(&[1.0, 0.0, 0.0, 1.0]);
        let x = vec![3.0, 4.0];
        let out = matmul(&x, 1, 2, &weight, 2);
        assert_eq!(out, vec![3.0, 4.0]);
    }

    #[test]
    fn rms_norm_unit_weight_normalises_to_unit_rms() {
        let weight = f16v(&[1.0, 1.0, 1.0, 1.0]);
        let x = vec![2.0, 2.0, 2.0, 2.0];
        let out = rms_norm(&x, 1, 4, &weight, 1e-6);
        for v in out {
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn swiglu_output_shape_matches_hidden_dim() {
        let hidden = 4;
        let intermediate = 8;
        let gate = f16v(&vec![0.1; intermediate * hidden]);
        let up = f16v(&vec![0.1; intermediate * hidden]);
        let down = f16v(&vec![0.1; hidden * intermediate]);
        let x = vec![1.0; hidden];
        let out = swiglu_mlp(&x, 1, hidden, intermediate, &gate, &up, &down);
        assert_eq!(out.len(), hidden);
    }
}
