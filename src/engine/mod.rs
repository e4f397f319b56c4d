//! Inference Engine (C8): owns the Arena, Pager, Scheduler and model
//! weights, and drives the tick loop that turns admitted requests into
//! generated tokens.

pub mod engine;

pub use engine::{Engine, EngineStats};
