//! Top-level error taxonomy for the engine.
//!
//! Each subsystem keeps its own small `thiserror` enum (`ArenaError`,
//! `PagerError`, ...); this module composes them into the handful of
//! kinds a caller or a scheduler tick actually needs to branch on.

use thiserror::Error;

use crate::cache::arena::ArenaError;
use crate::cache::pager::PagerError;
use crate::kernels::prefill::KernelError;

/// Recoverable-or-fatal error kinds surfaced by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Arena is full. Recoverable via preemption; never meant to reach a caller.
    #[error("out of blocks")]
    OutOfBlocks,

    /// Sequence would exceed model context.
    #[error("sequence would exceed max_position")]
    MaxPosition,

    /// Scheduler could not make room even after exhausting eviction candidates.
    #[error("no eviction capacity remaining")]
    NoCapacity,

    /// Bad sampling params, empty prompt, unknown stop token.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Submission backpressure.
    #[error("submission queue full")]
    QueueFull,

    /// Submission after shutdown.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// User-issued cancellation.
    #[error("request cancelled")]
    Cancelled,

    /// Programming error: dimension mismatch, kernel failure, unknown request id.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ArenaError> for EngineError {
    fn from(e: ArenaError) -> Self {
        match e {
            ArenaError::OutOfBlocks => EngineError::OutOfBlocks,
            ArenaError::InvalidBlock(id) => {
                EngineError::Internal(format!("invalid block id {id}"))
            }
            ArenaError::InvalidLayer(idx) => {
                EngineError::Internal(format!("invalid layer index {idx}"))
            }
        }
    }
}

impl From<PagerError> for EngineError {
    fn from(e: PagerError) -> Self {
        match e {
            PagerError::UnknownSequence(id) => {
                EngineError::Internal(format!("unknown sequence {id}"))
            }
            PagerError::MaxPosition => EngineError::MaxPosition,
            PagerError::Arena(inner) => inner.into(),
        }
    }
}

impl From<KernelError> for EngineError {
    fn from(e: KernelError) -> Self {
        EngineError::Internal(e.to_string())
    }
}
