//! Request lifecycle and state machine.
//!
//! Grounded on the `GenerationRequest`/`GenerationEvent` shape in the
//! old `inference::engine` module, generalized from a fire-and-forget
//! token stream into the full admit/prefill/decode/preempt/complete
//! state machine.

use crate::cache::pager::SeqId;
use crate::collaborators::TokenId;

pub type RequestId = u64;

/// Lifecycle state machine. Transitions are enforced by the Scheduler,
/// not by this type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Waiting,
    Prefilling,
    Decoding,
    Preempted,
    Completed,
    Cancelled,
    Failed,
}

/// Why a request stopped, carried on the final `token_callback` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop token or caller-provided stop string matched.
    Stop,
    /// `max_tokens` reached, or the sequence would exceed `max_position`.
    Length,
    /// Scheduler could not make room even after exhausting eviction candidates.
    Capacity,
    /// External cancel request.
    Cancelled,
    /// Unrecoverable internal error.
    Error,
}

#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub stop_tokens: Vec<TokenId>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            stop_tokens: Vec::new(),
        }
    }
}

/// The scheduler-facing view of a sequence. Token
/// delivery happens through `token_callback`, invoked strictly in
/// order for this request (no ordering guarantee across requests).
pub struct Request {
    pub request_id: RequestId,
    pub seq_id: Option<SeqId>,
    pub prompt_tokens: Vec<TokenId>,
    pub generated_tokens: Vec<TokenId>,
    pub sampling_params: SamplingParams,
    pub state: RequestState,
    pub stop_reason: Option<StopReason>,
    pub token_callback: Box<dyn FnMut(TokenId, bool) + Send>,
}

impl Request {
    pub fn new(
        request_id: RequestId,
        prompt_tokens: Vec<TokenId>,
        sampling_params: SamplingParams,
        token_callback: Box<dyn FnMut(TokenId, bool) + Send>,
    ) -> Self {
        Self {
            request_id,
            seq_id: None,
            prompt_tokens,
            generated_tokens: Vec::new(),
            sampling_params,
            state: RequestState::Waiting,
            stop_reason: None,
            token_callback,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            RequestState::Completed | RequestState::Cancelled | RequestState::Failed
        )
    }

    /// Delivers one generated token and, if this terminates the
    /// request, the final `finished=true` callback. Partial token
    /// streams are always terminated by a final callback.
    pub fn deliver(&mut self, token_id: TokenId, finished: bool) {
        (self.token_callback)(token_id, finished);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("request_id", &self.request_id)
            .field("seq_id", &self.seq_id)
            .field("state", &self.state)
            .field("stop_reason", &self.stop_reason)
            .field("generated_tokens", &self.generated_tokens.len())
            .finish()
    }
}
