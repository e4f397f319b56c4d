//! Named interface seams for out-of-scope collaborators.
//!
//! Tokenization, sampler strategies, and model-weight loading are
//! explicit Non-goals. Production front-ends inject real
//! implementations of these traits; this crate only ships trivial
//! test-only ones so the demo harness and integration tests are
//! runnable end to end.

use std::collections::HashMap;

use half::f16;

pub type TokenId = u32;

/// `encode`/`decode` plus the special token ids the scheduler needs to
/// recognise a stop condition.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;
    fn decode(&self, tokens: &[TokenId]) -> String;
    fn eos_id(&self) -> TokenId;
    fn bos_id(&self) -> TokenId;
}

/// Pure function `(logits, context) -> token`, injected into the
/// scheduler. `context` is the tokens generated so far for the
/// request, oldest first.
pub trait Sampler: Send + Sync {
    fn sample(&self, logits: &[f32], context: &[TokenId]) -> TokenId;
}

/// A mapping `tensor_name -> array` with the documented Llama-style
/// naming convention. `ModelForward` reads weights through this
/// seam rather than owning a GGUF/safetensors parser.
pub trait WeightSource: Send + Sync {
    /// Returns `None` if the tensor is not present in this source.
    fn tensor(&self, name: &str) -> Option<&[f16]>;
}

/// Whitespace tokenizer good enough for tests and the demo harness:
/// each distinct word gets an id in encounter order, ids 0/1 reserved
/// for bos/eos.
pub struct WhitespaceTokenizer {
    vocab: std::sync::Mutex<HashMap<String, TokenId>>,
    next_id: std::sync::atomic::AtomicU32,
}

impl Default for WhitespaceTokenizer {
    fn default() -> Self {
        Self {
            vocab: std::sync::Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU32::new(2),
        }
    }
}

impl Tokenizer for WhitespaceTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        let mut vocab = self.vocab.lock().unwrap();
        text.split_whitespace()
            .map(|word| {
                *vocab.entry(word.to_string()).or_insert_with(|| {
                    self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                })
            })
            .collect()
    }

    fn decode(&self, tokens: &[TokenId]) -> String {
        let vocab = self.vocab.lock().unwrap();
        let by_id: HashMap<TokenId, &str> =
            vocab.iter().map(|(w, id)| (*id, w.as_str())).collect();
        tokens
            .iter()
            .map(|id| by_id.get(id).copied().unwrap_or("<unk>"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn eos_id(&self) -> TokenId {
        1
    }

    fn bos_id(&self) -> TokenId {
        0
    }
}

/// Greedy (argmax) sampler: deterministic, so the same prompt and
/// cache state always produce the same generated tokens.
#[derive(Default)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(&self, logits: &[f32], _context: &[TokenId]) -> TokenId {
        logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx as TokenId)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_tokenizer_round_trips_words() {
        let tok = WhitespaceTokenizer::default();
        let ids = tok.encode("hello world hello");
        assert_eq!(ids[0], ids[2]);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(tok.decode(&ids), "hello world hello");
    }

    #[test]
    fn greedy_sampler_picks_argmax() {
        let sampler = GreedySampler;
        let logits = vec![0.1, 0.9, 0.3];
        assert_eq!(sampler.sample(&logits, &[]), 1);
    }
}
