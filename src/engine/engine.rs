//! The single-writer-thread engine: one `Engine` owns the Arena, Pager
//! and Scheduler exclusively, so every mutating call in this module
//! assumes it runs on that one thread. Concurrent callers submit and
//! cancel through whatever channel the embedding binary wires up (the
//! demo harness in `main.rs` calls straight through since it is itself
//! single-threaded); a networked front-end would hand `submit`/`cancel`
//! calls to this owning thread over an `mpsc` channel instead of
//! calling them directly from multiple tasks.

use tracing::{debug, info};

use crate::accelerator::AcceleratorContext;
use crate::cache::arena::Arena;
use crate::cache::pager::{Pager, SeqId};
use crate::collaborators::{Sampler, TokenId, Tokenizer, WeightSource};
use crate::config::Config;
use crate::error::EngineError;
use crate::model::forward::ModelForward;
use crate::scheduler::request::{RequestId, SamplingParams};
use crate::scheduler::scheduler::{Scheduler, SubmitError};

/// Point-in-time counters for observability (no metrics exporter is
/// wired up; a caller polls `Engine::stats`).
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub active_requests: usize,
    pub waiting_requests: usize,
    pub decoding_requests: usize,
    pub blocks_allocated: usize,
    pub blocks_free: usize,
    pub blocks_total: usize,
    pub tokens_generated_total: u64,
    pub prefill_tokens_total: u64,
    pub preemptions_total: u64,
}

pub struct Engine {
    arena: Arena,
    pager: Pager,
    scheduler: Scheduler,
    model: ModelForward,
    tokenizer: Box<dyn Tokenizer>,
    sampler: Box<dyn Sampler>,
    accel: AcceleratorContext,
    shutting_down: bool,
}

impl Engine {
    pub fn new(
        config: Config,
        weights: &impl WeightSource,
        tokenizer: Box<dyn Tokenizer>,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        let shape = crate::cache::block::BlockShape {
            num_layers: config.model.num_layers,
            block_size: config.cache.block_size_tokens,
            num_kv_heads: config.model.num_kv_heads,
            head_dim: config.model.head_dim,
        };
        let arena = Arena::new(config.cache.num_blocks, shape);
        let pager = Pager::new(config.cache.block_size_tokens);
        let scheduler = Scheduler::new(config.scheduler.clone(), config.cache.max_context_tokens);
        let model = ModelForward::load(
            config.model.clone(),
            weights,
            config.cache.max_context_tokens,
            config.cache.sliding_window_size,
        );
        let accel = AcceleratorContext::new();
        info!(backend = ?accel.backend(), "engine constructed");

        Self {
            arena,
            pager,
            scheduler,
            model,
            tokenizer,
            sampler,
            accel,
            shutting_down: false,
        }
    }

    pub fn backend(&self) -> crate::accelerator::Backend {
        self.accel.backend()
    }

    /// Tokenizes `prompt` and admits it. See [`Engine::submit_tokens`]
    /// for the token-level entry point.
    pub fn submit(
        &mut self,
        prompt: &str,
        sampling_params: SamplingParams,
        token_callback: Box<dyn FnMut(TokenId, bool) + Send>,
    ) -> Result<RequestId, EngineError> {
        let tokens = self.tokenizer.encode(prompt);
        self.submit_tokens(tokens, sampling_params, token_callback)
    }

    pub fn submit_tokens(
        &mut self,
        prompt_tokens: Vec<TokenId>,
        sampling_params: SamplingParams,
        token_callback: Box<dyn FnMut(TokenId, bool) + Send>,
    ) -> Result<RequestId, EngineError> {
        if self.shutting_down {
            return Err(EngineError::ShuttingDown);
        }
        self.scheduler
            .submit(prompt_tokens, sampling_params, token_callback)
            .map_err(|e| match e {
                SubmitError::QueueFull => EngineError::QueueFull,
                other => EngineError::InvalidRequest(other.to_string()),
            })
    }

    pub fn cancel(&mut self, request_id: RequestId) -> bool {
        self.scheduler.cancel(request_id, &mut self.pager, &mut self.arena)
    }

    /// Runs one prefill pass over `prompt_tokens` for `seq_id` and
    /// returns logits for the last token. Not a generation loop: the
    /// scheduler's worker loop (here, `tick`) calls this once per
    /// admitted prefill request per tick.
    fn forward_prefill(&mut self, seq_id: SeqId, prompt_tokens: &[TokenId]) -> Vec<f32> {
        self.model
            .forward_paged(prompt_tokens, seq_id, 0, &self.pager, &mut self.arena)
            .expect("scheduler keeps the page table consistent before forward dispatch")
    }

    /// Runs a single decode step for `seq_id`: one token in, one
    /// logits vector out. `start_position` is the token's position in
    /// the sequence (its already-reserved slot in the paged cache).
    fn forward_decode(
        &mut self,
        seq_id: SeqId,
        last_token: TokenId,
        start_position: usize,
    ) -> Vec<f32> {
        self.model
            .forward_paged(&[last_token], seq_id, start_position, &self.pager, &mut self.arena)
            .expect("scheduler keeps the page table consistent before forward dispatch")
    }

    /// Runs one scheduling tick: forms a batch, runs a forward pass per
    /// admitted prefill and active decode request, samples a token for
    /// each, and delivers it through the request's callback. Returns
    /// the number of requests advanced this tick.
    pub fn tick(&mut self) -> usize {
        let plan = self.scheduler.tick(&mut self.pager, &mut self.arena);
        if plan.is_empty() {
            return 0;
        }

        for request_id in &plan.prefill {
            let seq_id = self
                .scheduler
                .seq_id(*request_id)
                .expect("scheduler only plans prefill for requests it just admitted a sequence for");
            let prompt_tokens = self
                .scheduler
                .prompt_tokens(*request_id)
                .expect("scheduler only plans prefill for requests with a live prompt")
                .to_vec();

            let logits = self.forward_prefill(seq_id, &prompt_tokens);
            let token = self.sampler.sample(&logits, &prompt_tokens);
            debug!(request_id, token, "prefill produced first token");
            self.scheduler
                .on_token(*request_id, token, &mut self.pager, &mut self.arena);
        }

        for request_id in &plan.decode {
            let seq_id = self
                .scheduler
                .seq_id(*request_id)
                .expect("scheduler only plans decode for requests with a live sequence");
            let last_token = self
                .scheduler
                .last_generated_token(*request_id)
                .expect("a decoding request has produced at least one token");
            let cached_length = self
                .pager
                .cached_length(seq_id)
                .expect("scheduler already extended this sequence's cached_length this tick");
            let start_position = cached_length - 1;

            let logits = self.forward_decode(seq_id, last_token, start_position);
            let context = self.scheduler.generated_tokens(*request_id).unwrap_or(&[]);
            let token = self.sampler.sample(&logits, context);
            self.scheduler
                .on_token(*request_id, token, &mut self.pager, &mut self.arena);
        }

        plan.prefill.len() + plan.decode.len()
    }

    /// Drives ticks until no request is in flight or `max_ticks` is
    /// reached, whichever comes first. Intended for the demo harness
    /// and tests, not a production serving loop (which ticks
    /// continuously as requests arrive).
    pub fn run_until_idle(&mut self, max_ticks: usize) {
        for _ in 0..max_ticks {
            if self.scheduler.active_requests() == 0 {
                return;
            }
            self.tick();
        }
    }

    pub fn decode_text(&self, tokens: &[TokenId]) -> String {
        self.tokenizer.decode(tokens)
    }

    /// Cancels every in-flight request and refuses further submissions.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.scheduler.cancel_all(&mut self.pager, &mut self.arena);
        info!("engine shut down");
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_requests: self.scheduler.active_requests(),
            waiting_requests: self.scheduler.waiting_requests(),
            decoding_requests: self.scheduler.decoding_requests(),
            blocks_allocated: self.arena.capacity() - self.arena.free_count(),
            blocks_free: self.arena.free_count(),
            blocks_total: self.arena.capacity(),
            tokens_generated_total: self.scheduler.tokens_generated_total(),
            prefill_tokens_total: self.scheduler.prefill_tokens_total(),
            preemptions_total: self.scheduler.preemptions_total(),
        }
    }
}
