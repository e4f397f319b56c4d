//! Demo CLI harness for the paged-KV-cache inference engine core.
//!
//! Not a server: there is no REST/SSE surface in this crate (API shape
//! translation is a named Non-goal). This binary builds a toy
//! single-layer model with identity projections — the same toy model
//! spec scenario 1 names — submits one prompt through `Engine::submit`,
//! drains the token callbacks to stdout, and calls `shutdown()`. It
//! exists only to exercise the public surface end to end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use clap::Parser;
use half::f16;
use tracing::info;

use pagedkv_engine::collaborators::{
    GreedySampler, TokenId, Tokenizer, WeightSource, WhitespaceTokenizer,
};
use pagedkv_engine::config::{Cli, Config, ModelArchConfig};
use pagedkv_engine::engine::engine::Engine;
use pagedkv_engine::scheduler::request::SamplingParams;

/// In-memory tensor map standing in for a real GGUF/safetensors loader
/// (model weight loading is a named Non-goal).
struct ToyWeights(HashMap<String, Vec<f16>>);

impl WeightSource for ToyWeights {
    fn tensor(&self, name: &str) -> Option<&[f16]> {
        self.0.get(name).map(|v| v.as_slice())
    }
}

fn identity(out_dim: usize, in_dim: usize) -> Vec<f16> {
    let mut w = vec![f16::ZERO; out_dim * in_dim];
    for i in 0..out_dim.min(in_dim) {
        w[i * in_dim + i] = f16::ONE;
    }
    w
}

fn ones(n: usize) -> Vec<f16> {
    vec![f16::ONE; n]
}

/// Builds identity-projection weights for every tensor `ModelForward`
/// requires, named per the documented Llama-style convention.
fn toy_model_weights(arch: &ModelArchConfig) -> ToyWeights {
    let hidden = arch.hidden_size;
    let q_dim = arch.num_q_heads * arch.head_dim;
    let kv_dim = arch.num_kv_heads * arch.head_dim;
    let mut tensors = HashMap::new();

    tensors.insert("model.embed_tokens.weight".to_string(), identity(arch.vocab_size, hidden));
    tensors.insert("model.norm.weight".to_string(), ones(hidden));
    tensors.insert("lm_head.weight".to_string(), identity(arch.vocab_size, hidden));

    for i in 0..arch.num_layers {
        tensors.insert(format!("model.layers.{i}.self_attn.q_proj.weight"), identity(q_dim, hidden));
        tensors.insert(format!("model.layers.{i}.self_attn.k_proj.weight"), identity(kv_dim, hidden));
        tensors.insert(format!("model.layers.{i}.self_attn.v_proj.weight"), identity(kv_dim, hidden));
        tensors.insert(format!("model.layers.{i}.self_attn.o_proj.weight"), identity(hidden, q_dim));
        tensors.insert(format!("model.layers.{i}.input_layernorm.weight"), ones(hidden));
        tensors.insert(format!("model.layers.{i}.post_attention_layernorm.weight"), ones(hidden));
        tensors.insert(
            format!("model.layers.{i}.mlp.gate_proj.weight"),
            identity(arch.intermediate_size, hidden),
        );
        tensors.insert(
            format!("model.layers.{i}.mlp.up_proj.weight"),
            identity(arch.intermediate_size, hidden),
        );
        tensors.insert(
            format!("model.layers.{i}.mlp.down_proj.weight"),
            identity(hidden, arch.intermediate_size),
        );
    }

    ToyWeights(tensors)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "pagedkv_engine=debug"
    } else {
        "pagedkv_engine=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("pagedkv-engine v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    // The demo harness always runs the toy model regardless of what a
    // supplied config's `model` section says, since there is no real
    // weight loader behind it.
    config.model = ModelArchConfig {
        num_layers: 1,
        hidden_size: 8,
        num_q_heads: 2,
        num_kv_heads: 2,
        head_dim: 4,
        intermediate_size: 16,
        vocab_size: 256,
        rms_norm_eps: 1e-5,
    };
    config.cache.block_size_tokens = 16;
    config.cache.num_blocks = 16;
    config.cache.max_context_tokens = 256;

    info!(
        num_blocks = config.cache.num_blocks,
        block_size = config.cache.block_size_tokens,
        kv_bytes = config.total_kv_bytes(),
        "KV cache sized"
    );

    let weights = toy_model_weights(&config.model);
    let tokenizer: Box<dyn Tokenizer> = Box::new(WhitespaceTokenizer::default());
    let sampler = Box::new(GreedySampler);

    let mut engine = Engine::new(config, &weights, tokenizer, sampler);
    info!(backend = ?engine.backend(), "engine ready");

    let output = Arc::new(Mutex::new(Vec::new()));
    let output_cb = output.clone();
    let callback = Box::new(move |token: TokenId, finished: bool| {
        output_cb.lock().unwrap().push(token);
        if finished {
            info!("request finished");
        }
    });

    let sampling = SamplingParams {
        max_tokens: cli.max_tokens,
        stop_tokens: Vec::new(),
    };
    let request_id = engine.submit(&cli.prompt, sampling, callback)?;
    info!(request_id, prompt = %cli.prompt, "submitted request");

    engine.run_until_idle(cli.max_tokens + 4);

    let tokens = output.lock().unwrap().clone();
    println!("generated token ids: {tokens:?}");
    println!("decoded: {}", engine.decode_text(&tokens));
    println!("stats: {:?}", engine.stats());

    engine.shutdown();
    Ok(())
}
