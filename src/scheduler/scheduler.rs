//! Scheduler (C7): two FIFO queues, per-tick admission under a token
//! budget, and preemption under block pressure.
//!
//! Grounded on the `tokio::spawn` + channel delivery pattern in the old
//! `InferenceEngine::generate` (here generalized into `token_callback`
//! delivery through [`Request`]), with admission and token-budget
//! accounting additionally grounded on the `aici`/`rllm`
//! `BatchInfo` batch-construction shape.

use std::collections::{HashSet, VecDeque};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::arena::Arena;
use crate::cache::evictor::Evictor;
use crate::cache::pager::{Pager, PagerError, SeqId};
use crate::collaborators::TokenId;
use crate::config::SchedulerConfig;
use crate::scheduler::request::{Request, RequestId, RequestState, SamplingParams, StopReason};

/// One tick's dispatch plan: which requests to run through prefill,
/// which through decode, in that order.
#[derive(Debug, Default)]
pub struct TickPlan {
    pub prefill: Vec<RequestId>,
    pub decode: Vec<RequestId>,
}

impl TickPlan {
    pub fn is_empty(&self) -> bool {
        self.prefill.is_empty() && self.decode.is_empty()
    }
}

/// Rejection reasons from [`Scheduler::submit`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("empty prompt")]
    EmptyPrompt,
    #[error("prompt longer than max_context_tokens")]
    PromptTooLong,
    #[error("submission queue full")]
    QueueFull,
}

pub struct Scheduler {
    config: SchedulerConfig,
    max_context_tokens: usize,
    waiting_prefill: VecDeque<RequestId>,
    active_decode: VecDeque<RequestId>,
    requests: std::collections::HashMap<RequestId, Request>,
    cancelled: HashSet<RequestId>,
    evictor: Evictor,
    next_request_id: RequestId,
    tick_counter: u64,
    preemptions_total: u64,
    tokens_generated_total: u64,
    prefill_tokens_total: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, max_context_tokens: usize) -> Self {
        Self {
            config,
            max_context_tokens,
            waiting_prefill: VecDeque::new(),
            active_decode: VecDeque::new(),
            requests: std::collections::HashMap::new(),
            cancelled: HashSet::new(),
            evictor: Evictor::new(),
            next_request_id: 0,
            tick_counter: 0,
            preemptions_total: 0,
            tokens_generated_total: 0,
            prefill_tokens_total: 0,
        }
    }

    /// Synchronous admission-time validation.
    pub fn submit(
        &mut self,
        prompt_tokens: Vec<TokenId>,
        sampling_params: SamplingParams,
        token_callback: Box<dyn FnMut(TokenId, bool) + Send>,
    ) -> Result<RequestId, SubmitError> {
        if prompt_tokens.is_empty() {
            return Err(SubmitError::EmptyPrompt);
        }
        if prompt_tokens.len() > self.max_context_tokens {
            return Err(SubmitError::PromptTooLong);
        }
        let depth = self.waiting_prefill.len() + self.active_decode.len();
        if depth >= self.config.max_queue_depth {
            warn!(depth, "submission rejected: queue full");
            return Err(SubmitError::QueueFull);
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let request = Request::new(request_id, prompt_tokens, sampling_params, token_callback);
        self.requests.insert(request_id, request);
        self.waiting_prefill.push_back(request_id);
        debug!(request_id, "admitted to waiting_prefill");
        Ok(request_id)
    }

    /// WAITING -> CANCELLED is synchronous; DECODING/PREFILLING ->
    /// CANCELLED is honoured at the next tick boundary.
    pub fn cancel(&mut self, request_id: RequestId, pager: &mut Pager, arena: &mut Arena) -> bool {
        let state = match self.requests.get(&request_id) {
            Some(r) => r.state,
            None => return false,
        };
        match state {
            RequestState::Waiting | RequestState::Preempted => {
                self.waiting_prefill.retain(|&id| id != request_id);
                if let Some(req) = self.requests.get_mut(&request_id) {
                    req.state = RequestState::Cancelled;
                    req.stop_reason = Some(StopReason::Cancelled);
                    req.deliver(0, true);
                }
                if let Some(req) = self.requests.get(&request_id) {
                    if let Some(seq_id) = req.seq_id {
                        pager.destroy_sequence(seq_id, arena);
                        self.evictor.forget(seq_id);
                    }
                }
                true
            }
            RequestState::Prefilling | RequestState::Decoding => {
                self.cancelled.insert(request_id);
                true
            }
            RequestState::Completed | RequestState::Cancelled | RequestState::Failed => false,
        }
    }

    /// Cancels every request not already in a terminal state.
    pub fn cancel_all(&mut self, pager: &mut Pager, arena: &mut Arena) {
        let ids: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| !r.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for request_id in ids {
            self.cancel(request_id, pager, arena);
        }
    }

    pub fn active_requests(&self) -> usize {
        self.requests
            .values()
            .filter(|r| !r.is_terminal())
            .count()
    }

    pub fn waiting_requests(&self) -> usize {
        self.waiting_prefill.len()
    }

    pub fn decoding_requests(&self) -> usize {
        self.active_decode.len()
    }

    pub fn preemptions_total(&self) -> u64 {
        self.preemptions_total
    }

    pub fn tokens_generated_total(&self) -> u64 {
        self.tokens_generated_total
    }

    pub fn prefill_tokens_total(&self) -> u64 {
        self.prefill_tokens_total
    }

    pub fn prompt_tokens(&self, request_id: RequestId) -> Option<&[TokenId]> {
        self.requests.get(&request_id).map(|r| r.prompt_tokens.as_slice())
    }

    pub fn seq_id(&self, request_id: RequestId) -> Option<SeqId> {
        self.requests.get(&request_id).and_then(|r| r.seq_id)
    }

    pub fn generated_tokens(&self, request_id: RequestId) -> Option<&[TokenId]> {
        self.requests.get(&request_id).map(|r| r.generated_tokens.as_slice())
    }

    /// The most recently sampled token for this request. Valid once the
    /// request has produced at least one token (i.e. whenever it can
    /// appear in a decode batch).
    pub fn last_generated_token(&self, request_id: RequestId) -> Option<TokenId> {
        self.requests
            .get(&request_id)
            .and_then(|r| r.generated_tokens.last().copied())
    }

    /// Forms one tick's batch: decode first (or prefill first, per
    /// `decode_priority`), triggering preemption on block pressure.
    pub fn tick(&mut self, pager: &mut Pager, arena: &mut Arena) -> TickPlan {
        self.tick_counter += 1;
        let mut plan = TickPlan::default();
        let mut total_budget_used = 0usize;

        if self.config.decode_priority {
            self.run_decode_step(pager, arena, &mut plan, &mut total_budget_used);
            self.run_prefill_step(pager, arena, &mut plan, &mut total_budget_used);
        } else {
            self.run_prefill_step(pager, arena, &mut plan, &mut total_budget_used);
            self.run_decode_step(pager, arena, &mut plan, &mut total_budget_used);
        }

        self.active_decode
            .retain(|id| self.requests.get(id).map(|r| !r.is_terminal()).unwrap_or(false));

        plan
    }

    fn run_decode_step(
        &mut self,
        pager: &mut Pager,
        arena: &mut Arena,
        plan: &mut TickPlan,
        total_budget_used: &mut usize,
    ) {
        let candidates: Vec<RequestId> = self.active_decode.iter().copied().collect();
        for request_id in candidates {
            if plan.decode.len() >= self.config.max_decode_tokens
                || *total_budget_used >= self.config.total_token_budget
            {
                break;
            }
            let seq_id = match self.requests.get(&request_id).and_then(|r| r.seq_id) {
                Some(s) => s,
                None => continue,
            };

            match pager.append_tokens(seq_id, 1, arena) {
                Ok(()) => {
                    plan.decode.push(request_id);
                    *total_budget_used += 1;
                    self.evictor.on_touch(seq_id, self.tick_counter);
                }
                Err(PagerError::Arena(_)) => {
                    if self.try_preempt_and_retry(request_id, seq_id, pager, arena, plan) {
                        plan.decode.push(request_id);
                        *total_budget_used += 1;
                        self.evictor.on_touch(seq_id, self.tick_counter);
                    } else {
                        self.fail_request(request_id, StopReason::Capacity, pager, arena);
                    }
                }
                Err(PagerError::MaxPosition) => {
                    self.complete_request(request_id, StopReason::Length, pager, arena);
                }
                Err(PagerError::UnknownSequence(_)) => {
                    self.fail_request(request_id, StopReason::Error, pager, arena);
                }
            }
        }
    }

    fn run_prefill_step(
        &mut self,
        pager: &mut Pager,
        arena: &mut Arena,
        plan: &mut TickPlan,
        total_budget_used: &mut usize,
    ) {
        let mut prefill_token_budget_used = 0usize;
        let mut seqs_this_tick = plan.prefill.len() + plan.decode.len();

        while let Some(&request_id) = self.waiting_prefill.front() {
            if seqs_this_tick >= self.config.max_batch_requests {
                break;
            }
            let prompt_len = match self.requests.get(&request_id) {
                Some(r) => r.prompt_tokens.len(),
                None => {
                    self.waiting_prefill.pop_front();
                    continue;
                }
            };

            if prefill_token_budget_used + prompt_len > self.config.max_prefill_tokens
                || *total_budget_used + prompt_len > self.config.total_token_budget
            {
                break;
            }

            let blocks_needed = (prompt_len + pager.block_size() - 1) / pager.block_size();
            if !pager.can_allocate(blocks_needed, arena)
                && !self.ensure_capacity(blocks_needed, pager, arena, plan)
            {
                // Preemption couldn't free enough blocks either: leave
                // the request at the front so FIFO order is preserved
                // once capacity frees up on its own.
                break;
            }

            // `ensure_capacity` may have preempted a decoding sequence and
            // pushed it back to the front of this same queue, so the
            // request we peeked is no longer necessarily at the front:
            // remove it by id rather than assuming position.
            let queue_pos = self
                .waiting_prefill
                .iter()
                .position(|&id| id == request_id)
                .expect("request_id was just peeked from this queue");
            self.waiting_prefill.remove(queue_pos);
            let seq_id = pager.new_sequence(self.max_context_tokens);
            let req = self.requests.get_mut(&request_id).expect("looked up above");
            req.seq_id = Some(seq_id);
            req.state = RequestState::Prefilling;

            match pager.append_tokens(seq_id, prompt_len, arena) {
                Ok(()) => {
                    plan.prefill.push(request_id);
                    seqs_this_tick += 1;
                    prefill_token_budget_used += prompt_len;
                    *total_budget_used += prompt_len;
                    self.prefill_tokens_total += prompt_len as u64;
                    self.evictor.on_touch(seq_id, self.tick_counter);
                }
                Err(PagerError::MaxPosition) => {
                    self.complete_request(request_id, StopReason::Length, pager, arena);
                }
                Err(_) => {
                    self.fail_request(request_id, StopReason::Capacity, pager, arena);
                }
            }
        }
    }

    /// : evict the LRU decoding sequence not in this tick's
    /// already-scheduled batch, retry once. Returns whether the retry
    /// succeeded.
    fn try_preempt_and_retry(
        &mut self,
        request_id: RequestId,
        seq_id: SeqId,
        pager: &mut Pager,
        arena: &mut Arena,
        plan: &TickPlan,
    ) -> bool {
        loop {
            let candidates: Vec<(RequestId, SeqId)> = self
                .requests
                .iter()
                .filter(|(id, r)| {
                    r.state == RequestState::Decoding
                        && **id != request_id
                        && !plan.decode.contains(id)
                })
                .filter_map(|(id, r)| r.seq_id.map(|s| (*id, s)))
                .collect();

            if candidates.is_empty() {
                return false;
            }

            let seq_ids: Vec<SeqId> = candidates.iter().map(|(_, s)| *s).collect();
            let victim_seq = match self.evictor.choose_victim(&seq_ids) {
                Some(s) => s,
                None => return false,
            };
            let victim_request = candidates
                .iter()
                .find(|(_, s)| *s == victim_seq)
                .map(|(id, _)| *id)
                .expect("choose_victim returned a candidate's seq_id");

            self.preempt(victim_request, victim_seq, pager, arena);

            match pager.append_tokens(seq_id, 1, arena) {
                Ok(()) => return true,
                Err(PagerError::Arena(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    /// Evicts LRU decoding sequences (excluding this tick's
    /// already-scheduled decode batch) until the Arena can satisfy
    /// `blocks_needed`, or no eviction candidates remain. Admission
    /// failing on block pressure is itself a preemption trigger, not
    /// just a failed `append_tokens` during decode continuation.
    fn ensure_capacity(
        &mut self,
        blocks_needed: usize,
        pager: &mut Pager,
        arena: &mut Arena,
        plan: &TickPlan,
    ) -> bool {
        while !pager.can_allocate(blocks_needed, arena) {
            let candidates: Vec<(RequestId, SeqId)> = self
                .requests
                .iter()
                .filter(|(id, r)| r.state == RequestState::Decoding && !plan.decode.contains(id))
                .filter_map(|(id, r)| r.seq_id.map(|s| (*id, s)))
                .collect();

            if candidates.is_empty() {
                return false;
            }

            let seq_ids: Vec<SeqId> = candidates.iter().map(|(_, s)| *s).collect();
            let victim_seq = match self.evictor.choose_victim(&seq_ids) {
                Some(s) => s,
                None => return false,
            };
            let victim_request = candidates
                .iter()
                .find(|(_, s)| *s == victim_seq)
                .map(|(id, _)| *id)
                .expect("choose_victim returned a candidate's seq_id");

            self.preempt(victim_request, victim_seq, pager, arena);
        }
        true
    }

    fn preempt(&mut self, request_id: RequestId, seq_id: SeqId, pager: &mut Pager, arena: &mut Arena) {
        pager.destroy_sequence(seq_id, arena);
        self.evictor.forget(seq_id);
        self.active_decode.retain(|&id| id != request_id);
        self.preemptions_total += 1;

        if let Some(req) = self.requests.get_mut(&request_id) {
            req.state = RequestState::Preempted;
            req.seq_id = None;
        }
        self.waiting_prefill.push_front(request_id);
        info!(request_id, seq_id, "preempted sequence under block pressure");
    }

    fn fail_request(
        &mut self,
        request_id: RequestId,
        reason: StopReason,
        pager: &mut Pager,
        arena: &mut Arena,
    ) {
        let seq_id = self.requests.get(&request_id).and_then(|r| r.seq_id);
        if let Some(seq_id) = seq_id {
            pager.destroy_sequence(seq_id, arena);
            self.evictor.forget(seq_id);
        }
        self.active_decode.retain(|&id| id != request_id);
        if let Some(req) = self.requests.get_mut(&request_id) {
            let last_token = req.generated_tokens.last().copied().unwrap_or(0);
            req.state = RequestState::Failed;
            req.stop_reason = Some(reason);
            req.deliver(last_token, true);
        }
        warn!(request_id, ?reason, "request failed");
    }

    /// Like `fail_request`, but for terminal conditions that are a
    /// normal completion rather than a failure (running into
    /// `max_position` is a length stop, not an error).
    fn complete_request(
        &mut self,
        request_id: RequestId,
        reason: StopReason,
        pager: &mut Pager,
        arena: &mut Arena,
    ) {
        let seq_id = self.requests.get(&request_id).and_then(|r| r.seq_id);
        if let Some(seq_id) = seq_id {
            pager.destroy_sequence(seq_id, arena);
            self.evictor.forget(seq_id);
        }
        self.active_decode.retain(|&id| id != request_id);
        if let Some(req) = self.requests.get_mut(&request_id) {
            let last_token = req.generated_tokens.last().copied().unwrap_or(0);
            req.state = RequestState::Completed;
            req.stop_reason = Some(reason);
            req.deliver(last_token, true);
        }
        info!(request_id, ?reason, "request completed");
    }

    /// Called by the Engine's worker after it samples a token for a
    /// request this tick's plan included (either prefill's first
    /// token, or a decode step's token). Handles stop-condition
    /// checks, cancellation honoured at this tick boundary, and moving
    /// the request between queues.
    pub fn on_token(
        &mut self,
        request_id: RequestId,
        token_id: TokenId,
        pager: &mut Pager,
        arena: &mut Arena,
    ) {
        let seq_id = match self.requests.get(&request_id).and_then(|r| r.seq_id) {
            Some(s) => s,
            None => return,
        };

        let (stop_token, max_tokens, generated_len, was_cancelled);
        {
            let req = self.requests.get_mut(&request_id).expect("seq_id lookup above");
            req.generated_tokens.push(token_id);
            stop_token = req.sampling_params.stop_tokens.contains(&token_id);
            max_tokens = req.sampling_params.max_tokens;
            generated_len = req.generated_tokens.len();
            was_cancelled = self.cancelled.remove(&request_id);
        }
        self.tokens_generated_total += 1;

        let length_exceeded = generated_len >= max_tokens
            || pager.cached_length(seq_id).unwrap_or(0) >= pager.max_position(seq_id).unwrap_or(usize::MAX);

        let stop_reason = if was_cancelled {
            Some(StopReason::Cancelled)
        } else if stop_token {
            Some(StopReason::Stop)
        } else if length_exceeded {
            Some(StopReason::Length)
        } else {
            None
        };

        match stop_reason {
            Some(reason) => {
                let req = self.requests.get_mut(&request_id).expect("checked above");
                req.state = RequestState::Completed;
                req.stop_reason = Some(reason);
                req.deliver(token_id, true);
                pager.destroy_sequence(seq_id, arena);
                self.evictor.forget(seq_id);
                self.active_decode.retain(|&id| id != request_id);
            }
            None => {
                let req = self.requests.get_mut(&request_id).expect("checked above");
                let was_prefilling = req.state == RequestState::Prefilling;
                req.state = RequestState::Decoding;
                req.deliver(token_id, false);
                if was_prefilling {
                    self.active_decode.push_back(request_id);
                }
            }
        }
    }
}
