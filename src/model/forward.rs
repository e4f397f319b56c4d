//! Model Forward (C6): composes N attention layers with RMSNorm +
//! SwiGLU feed-forward blocks; returns logits for the last position
//! only.

use half::f16;

use crate::cache::arena::Arena;
use crate::cache::pager::{Pager, SeqId};
use crate::collaborators::WeightSource;
use crate::config::ModelArchConfig;
use crate::kernels::prefill::KernelError;
use crate::kernels::reference::ContiguousCache;
use crate::kernels::rope::RopeTable;
use crate::kernels::KernelDims;
use crate::model::attention::{AttentionLayer, AttentionWeights, CacheHandle};
use crate::model::ops::{add_residual, matmul, rms_norm, swiglu_mlp};

/// A forward pass is a prefill when more than one token is supplied,
/// a decode step when exactly one is. Zero tokens is invalid
/// and the caller's responsibility to avoid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    Prefill,
    Decode,
}

pub fn forward_kind(num_tokens: usize) -> ForwardKind {
    if num_tokens > 1 {
        ForwardKind::Prefill
    } else {
        ForwardKind::Decode
    }
}

struct LayerWeights {
    attn: AttentionLayer,
    input_norm: Vec<f16>,
    post_attn_norm: Vec<f16>,
    gate_proj: Vec<f16>,
    up_proj: Vec<f16>,
    down_proj: Vec<f16>,
}

/// Composed model: embedding lookup, N attention+MLP blocks, final
/// norm, LM head. Weight names follow the documented Llama-style
/// convention.
pub struct ModelForward {
    arch: ModelArchConfig,
    embed_tokens: Vec<f16>,
    final_norm: Vec<f16>,
    lm_head: Vec<f16>,
    layers: Vec<LayerWeights>,
    rope: RopeTable,
    /// Decode-step context window, in tokens; `None` disables windowing
    /// and attends over the full cached history.
    sliding_window: Option<usize>,
}

impl ModelForward {
    /// Loads every named tensor through `WeightSource` (naming
    /// convention: `model.layers.{i}.self_attn.{q,k,v,o}_proj.weight`,
    /// `model.layers.{i}.{input_layernorm,post_attention_layernorm}.weight`,
    /// `model.layers.{i}.mlp.{gate,up,down}_proj.weight`,
    /// `model.embed_tokens.weight`, `model.norm.weight`, `lm_head.weight`).
    pub fn load(
        arch: ModelArchConfig,
        weights: &impl WeightSource,
        max_position: usize,
        sliding_window: Option<usize>,
    ) -> Self {
        let get = |name: &str| -> Vec<f16> {
            weights
                .tensor(name)
                .unwrap_or_else(|| panic!("missing required tensor {name}"))
                .to_vec()
        };

        let embed_tokens = get("model.embed_tokens.weight");
        let final_norm = get("model.norm.weight");
        let lm_head = get("lm_head.weight");

        let mut layers = Vec::with_capacity(arch.num_layers);
        for i in 0..arch.num_layers {
            layers.push(LayerWeights {
                attn: AttentionLayer {
                    layer_idx: i,
                    weights: AttentionWeights {
                        q_proj: get(&format!("model.layers.{i}.self_attn.q_proj.weight")),
                        k_proj: get(&format!("model.layers.{i}.self_attn.k_proj.weight")),
                        v_proj: get(&format!("model.layers.{i}.self_attn.v_proj.weight")),
                        o_proj: get(&format!("model.layers.{i}.self_attn.o_proj.weight")),
                    },
                },
                input_norm: get(&format!("model.layers.{i}.input_layernorm.weight")),
                post_attn_norm: get(&format!("model.layers.{i}.post_attention_layernorm.weight")),
                gate_proj: get(&format!("model.layers.{i}.mlp.gate_proj.weight")),
                up_proj: get(&format!("model.layers.{i}.mlp.up_proj.weight")),
                down_proj: get(&format!("model.layers.{i}.mlp.down_proj.weight")),
            });
        }

        let rope = RopeTable::new(max_position, arch.head_dim, 10000.0);

        Self {
            arch,
            embed_tokens,
            final_norm,
            lm_head,
            layers,
            rope,
            sliding_window,
        }
    }

    fn kernel_dims(&self, layer_idx: usize) -> KernelDims {
        KernelDims {
            num_q_heads: self.arch.num_q_heads,
            num_kv_heads: self.arch.num_kv_heads,
            head_dim: self.arch.head_dim,
            block_size: 0, // set per call site from the live Pager's block size
            num_layers: self.arch.num_layers,
            layer_idx,
        }
    }

    fn embed(&self, tokens: &[u32]) -> Vec<f32> {
        let hidden = self.arch.hidden_size;
        let mut x = vec![0.0f32; tokens.len() * hidden];
        for (t, &tok) in tokens.iter().enumerate() {
            let row = tok as usize * hidden;
            for d in 0..hidden {
                x[t * hidden + d] = self.embed_tokens[row + d].to_f32();
            }
        }
        x
    }

    /// Runs the full stack against the paged cache for `seq_id`. The
    /// caller (the Engine's worker) is responsible for having already
    /// extended the Pager's `cached_length` by `tokens.len()` before
    /// calling. Returns logits for the last token only, `[vocab_size]`.
    pub fn forward_paged(
        &self,
        tokens: &[u32],
        seq_id: SeqId,
        start_position: usize,
        pager: &Pager,
        arena: &mut Arena,
    ) -> Result<Vec<f32>, KernelError> {
        let block_size = pager.block_size();
        let hidden = self.arch.hidden_size;
        let mut x = self.embed(tokens);
        let num_tokens = tokens.len();

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let normed = rms_norm(&x, num_tokens, hidden, &layer.input_norm, self.arch.rms_norm_eps);
            let mut dims = self.kernel_dims(layer_idx);
            dims.block_size = block_size;

            let attn_out = layer.attn.forward(
                &normed,
                num_tokens,
                hidden,
                start_position,
                CacheHandle::Paged {
                    seq_id,
                    pager,
                    arena,
                },
                &self.rope,
                dims,
                self.sliding_window,
            )?;
            x = add_residual(&x, &attn_out);

            let normed2 = rms_norm(&x, num_tokens, hidden, &layer.post_attn_norm, self.arch.rms_norm_eps);
            let mlp_out = swiglu_mlp(
                &normed2,
                num_tokens,
                hidden,
                self.arch.intermediate_size,
                &layer.gate_proj,
                &layer.up_proj,
                &layer.down_proj,
            );
            x = add_residual(&x, &mlp_out);
        }

        let normed_final = rms_norm(&x, num_tokens, hidden, &self.final_norm, self.arch.rms_norm_eps);
        let last_row_start = (num_tokens - 1) * hidden;
        let last_hidden = &normed_final[last_row_start..last_row_start + hidden];
        Ok(matmul(last_hidden, 1, hidden, &self.lm_head, self.arch.vocab_size))
    }

    /// Non-cached path: used by tests and short sequences. The
    /// caller owns one `ContiguousCache` per layer across the calls
    /// that make up a generation.
    pub fn forward_simple(
        &self,
        tokens: &[u32],
        start_position: usize,
        caches: &mut [ContiguousCache],
    ) -> Vec<f32> {
        assert_eq!(caches.len(), self.layers.len());
        let hidden = self.arch.hidden_size;
        let mut x = self.embed(tokens);
        let num_tokens = tokens.len();

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let normed = rms_norm(&x, num_tokens, hidden, &layer.input_norm, self.arch.rms_norm_eps);
            let mut dims = self.kernel_dims(layer_idx);
            dims.block_size = 1; // unused by the simple path

            let attn_out = layer
                .attn
                .forward(
                    &normed,
                    num_tokens,
                    hidden,
                    start_position,
                    CacheHandle::Simple(&mut caches[layer_idx]),
                    &self.rope,
                    dims,
                    self.sliding_window,
                )
                .expect("the simple path never hits a kernel-level error");
            x = add_residual(&x, &attn_out);

            let normed2 = rms_norm(&x, num_tokens, hidden, &layer.post_attn_norm, self.arch.rms_norm_eps);
            let mlp_out = swiglu_mlp(
                &normed2,
                num_tokens,
                hidden,
                self.arch.intermediate_size,
                &layer.gate_proj,
                &layer.up_proj,
                &layer.down_proj,
            );
            x = add_residual(&x, &mlp_out);
        }

        let normed_final = rms_norm(&x, num_tokens, hidden, &self.final_norm, self.arch.rms_norm_eps);
        let last_row_start = (num_tokens - 1) * hidden;
        let last_hidden = &normed_final[last_row_start..last_row_start + hidden];
        matmul(last_hidden, 1, hidden, &self.lm_head, self.arch.vocab_size)
    }

    pub fn new_simple_caches(&self) -> Vec<ContiguousCache> {
        (0..self.layers.len()).map(|_| ContiguousCache::default()).collect()
    }

    pub fn arch(&self) -> &ModelArchConfig {
        &self.arch
    }
}
