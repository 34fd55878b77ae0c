//! Residual vector quantizer and its building blocks.
//!
//! - [`codebook`]: learned code table and cosine nearest-neighbour search
//! - [`stale`]: per-entry usage counters and dead-code revival
//! - [`projection`]: per-frame projections in and out of codebook space
//! - [`vector`]: one quantizer stage
//! - [`residual`]: the stack of stages, quantizer dropout, decode paths

pub mod codebook;
pub mod projection;
pub mod residual;
pub mod stale;
pub mod vector;

pub use codebook::Codebook;
pub use projection::Projection;
pub use residual::{Decoded, QuantizedOutput, ResidualQuantizer, VqLosses};
pub use stale::StaleTracker;
pub use vector::{StageOutput, TrainingStageOutput, VectorQuantizer};
