//! Rotary positional embedding (RoPE), applied to Q and K in place
//! before attention.
//!
//! Grounded on the GQA/head-dim shape conventions in
//! `other_examples/atoma-network-atoma-paged-attention`; RoPE itself
//! has no direct analogue in that file, so the rotation math here
//! follows the standard half-rotate formulation (`head_dim/2` cos/sin
//! pairs for `rope_cos`/`rope_sin`).

/// Precomputed `[max_position, head_dim/2]` tables, row-major.
pub struct RopeTable {
    pub cos: Vec<f32>,
    pub sin: Vec<f32>,
    pub head_dim: usize,
}

impl RopeTable {
    /// Standard inverse-frequency construction: `theta_i = base^(-2i/head_dim)`.
    pub fn new(max_position: usize, head_dim: usize, base: f32) -> Self {
        let half_dim = head_dim / 2;
        let mut cos = Vec::with_capacity(max_position * half_dim);
        let mut sin = Vec::with_capacity(max_position * half_dim);
        for pos in 0..max_position {
            for i in 0..half_dim {
                let theta = (pos as f32) / base.powf((2 * i) as f32 / head_dim as f32);
                cos.push(theta.cos());
                sin.push(theta.sin());
            }
        }
        Self { cos, sin, head_dim }
    }

    fn row(&self, position: usize) -> (&[f32], &[f32]) {
        let half_dim = self.head_dim / 2;
        let start = position * half_dim;
        (&self.cos[start..start + half_dim], &self.sin[start..start + half_dim])
    }

    /// Rotate one head's vector (`head_dim` elements) in place at the
    /// given absolute position, using the standard "rotate half"
    /// pairing: `(x_i, x_{i+half}) -> (x_i cos - x_{i+half} sin, x_i sin + x_{i+half} cos)`.
    pub fn apply(&self, vec: &mut [f32], position: usize) {
        let half_dim = self.head_dim / 2;
        let (cos, sin) = self.row(position);
        for i in 0..half_dim {
            let a = vec[i];
            let b = vec[i + half_dim];
            vec[i] = a * cos[i] - b * sin[i];
            vec[i + half_dim] = a * sin[i] + b * cos[i];
        }
    }
}
