//! Transformer compute: per-layer attention and the composed forward
//! pass (C5, C6).

pub mod attention;
pub mod forward;
pub mod ops;
