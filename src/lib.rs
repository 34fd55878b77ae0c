//! Residual vector quantization for neural audio codecs.
//!
//! Turns continuous latent frames `[batch, D, time]` into a stack of
//! discrete codes `[batch, N, time]` and back. Each of the `N` stages
//! projects the current residual into a small codebook space, picks the
//! cosine-nearest codebook entry, and projects it back out; the next stage
//! quantizes whatever is left.
//!
//! ```text
//! z ──► stage 0 ──► residual ──► stage 1 ──► ... ──► stage N-1
//!          │                        │                    │
//!          ▼                        ▼                    ▼
//!       code[0]                  code[1]            code[N-1]
//!          └──────────── sum of projected entries ───────┘ = z_q
//! ```
//!
//! ## Modules
//!
//! - [`frames`]: contiguous `[batch, channels, time]` frames and codes
//! - [`quantizer`]: codebooks, stages, the residual stack
//! - [`checkpoint`]: safetensors load/save
//! - [`codec`]: frames/tensors ⇄ codes facade
//! - [`config`]: serde configuration

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod frames;
pub mod quantizer;

mod error;

pub use codec::Codec;
pub use config::{CodebookDim, LossWeights, QuantizerConfig};
pub use error::{Error, Result};
pub use frames::{Codes, Frames};
pub use quantizer::{QuantizedOutput, ResidualQuantizer, VectorQuantizer};
