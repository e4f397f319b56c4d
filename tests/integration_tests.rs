//! End-to-end integration tests for the public `Engine` surface:
//! exact token counts, cancellation, and multi-request batching
//! without starvation.
//!
//! These use a toy single-layer model with identity projections: with
//! an identity embedding, identity Q/K/V/O projections and an identity
//! `lm_head`, each forward pass reproduces its input as logits, so a
//! greedy sampler run against it is fully deterministic and the exact
//! output token sequence can be asserted on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use half::f16;

use pagedkv_engine::collaborators::{GreedySampler, TokenId, WeightSource, WhitespaceTokenizer};
use pagedkv_engine::config::{CacheConfig, Config, ModelArchConfig, SchedulerConfig};
use pagedkv_engine::engine::engine::Engine;
use pagedkv_engine::scheduler::request::SamplingParams;

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

fn toy_arch() -> ModelArchConfig {
    ModelArchConfig {
        num_layers: 1,
        hidden_size: 8,
        num_q_heads: 2,
        num_kv_heads: 2,
        head_dim: 4,
        intermediate_size: 16,
        vocab_size: 32,
        rms_norm_eps: 1e-5,
    }
}

fn toy_weights(arch: &ModelArchConfig) -> ToyWeights {
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

fn toy_engine(num_blocks: usize, block_size: usize, decode_priority: bool) -> Engine {
    let arch = toy_arch();
    let config = Config {
        scheduler: SchedulerConfig {
            max_batch_requests: 8,
            max_prefill_tokens: 4096,
            max_decode_tokens: 64,
            total_token_budget: 4096,
            decode_priority,
            max_queue_depth: 256,
        },
        cache: CacheConfig {
            block_size_tokens: block_size,
            num_blocks,
            sliding_window_size: None,
            max_context_tokens: 256,
        },
        model: arch.clone(),
    };
    let weights = toy_weights(&arch);
    let tokenizer = Box::new(WhitespaceTokenizer::default());
    let sampler = Box::new(GreedySampler);
    Engine::new(config, &weights, tokenizer, sampler)
}

fn collecting_callback() -> (
    Box<dyn FnMut(TokenId, bool) + Send>,
    Arc<Mutex<Vec<(TokenId, bool)>>>,
) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let log2 = log.clone();
    (Box::new(move |t, f| log2.lock().unwrap().push((t, f))), log)
}

/// Scenario 1: a single short prompt runs to its exact `max_tokens`
/// budget, the final callback reports `finished=true`, and every
/// block the request held is returned to the arena.
#[test]
fn single_request_generates_exact_token_count_and_frees_its_blocks() {
    let mut engine = toy_engine(8, 16, true);
    let (cb, log) = collecting_callback();

    let sampling = SamplingParams { max_tokens: 5, stop_tokens: vec![] };
    engine.submit_tokens(vec![1, 2, 3], sampling, cb).unwrap();

    let blocks_before = engine.stats().blocks_free;
    engine.run_until_idle(64);

    let calls = log.lock().unwrap().clone();
    assert_eq!(calls.len(), 5, "exactly max_tokens callbacks fire");
    assert!(calls[..4].iter().all(|&(_, finished)| !finished));
    assert!(calls[4].1, "final callback reports finished");

    assert_eq!(engine.stats().active_requests, 0);
    assert_eq!(
        engine.stats().blocks_free,
        blocks_before,
        "completion frees every block the request held"
    );
}

/// Scenario 5: cancelling a request mid-decode stops further token
/// delivery and the final callback's `finished` flag is still set.
#[test]
fn cancelling_mid_decode_stops_generation_and_frees_blocks() {
    let mut engine = toy_engine(8, 16, true);
    let (cb, log) = collecting_callback();

    let sampling = SamplingParams { max_tokens: 50, stop_tokens: vec![] };
    let request_id = engine.submit_tokens(vec![1, 2, 3], sampling, cb).unwrap();

    // Let it prefill and decode a handful of tokens.
    for _ in 0..3 {
        engine.tick();
    }
    assert!(engine.cancel(request_id));

    // Cancellation is honoured at the next tick boundary.
    for _ in 0..3 {
        if engine.stats().active_requests == 0 {
            break;
        }
        engine.tick();
    }

    assert_eq!(engine.stats().active_requests, 0);
    let calls = log.lock().unwrap().clone();
    assert!(calls.len() < 50, "cancellation cuts generation short of max_tokens");
    assert!(calls.last().unwrap().1, "final callback reports finished even on cancellation");
    assert_eq!(engine.stats().blocks_free, 8, "cancelled request's blocks are returned");
}

/// Scenario 6: several short requests submitted together are all
/// admitted and none is starved — every one reaches its own
/// `max_tokens` budget.
#[test]
fn multiple_requests_batch_together_without_starvation() {
    let mut engine = toy_engine(8, 16, true);

    let mut logs = Vec::new();
    for i in 0..4 {
        let (cb, log) = collecting_callback();
        let sampling = SamplingParams { max_tokens: 3 + i, stop_tokens: vec![] };
        engine.submit_tokens(vec![1 + i as u32, 2, 3], sampling, cb).unwrap();
        logs.push((3 + i, log));
    }

    engine.run_until_idle(128);

    assert_eq!(engine.stats().active_requests, 0);
    for (expected_tokens, log) in logs {
        let calls = log.lock().unwrap().clone();
        assert_eq!(calls.len(), expected_tokens, "every request reaches its own budget");
        assert!(calls.last().unwrap().1);
    }
}

/// A stop token honoured mid-budget ends generation before
/// `max_tokens` is reached, with `finished=true` on that final token.
/// The greedy sampler against a fixed toy model is fully
/// deterministic, so a token observed on one run will recur at the
/// same position on another: probe for one, then confirm declaring it
/// a stop token cuts generation short of the same run without it.
#[test]
fn stop_token_ends_generation_before_max_tokens() {
    let probe_tokens = {
        let mut engine = toy_engine(8, 16, true);
        let (cb, log) = collecting_callback();
        let sampling = SamplingParams { max_tokens: 10, stop_tokens: vec![] };
        engine.submit_tokens(vec![1, 2, 3], sampling, cb).unwrap();
        engine.run_until_idle(32);
        log.lock().unwrap().iter().map(|&(t, _)| t).collect::<Vec<_>>()
    };
    assert_eq!(probe_tokens.len(), 10);
    let stop_token = probe_tokens[2];

    let mut engine = toy_engine(8, 16, true);
    let (cb, log) = collecting_callback();
    let sampling = SamplingParams { max_tokens: 50, stop_tokens: vec![stop_token] };
    engine.submit_tokens(vec![1, 2, 3], sampling, cb).unwrap();
    engine.run_until_idle(64);

    assert_eq!(engine.stats().active_requests, 0);
    let calls = log.lock().unwrap().clone();
    assert_eq!(calls.len(), 3, "generation stops as soon as the third token matches");
    assert!(calls.last().unwrap().1);
}
