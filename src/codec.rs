//! Token-level codec on top of [`ResidualQuantizer`].
//!
//! [`Codec`] owns a configuration and a quantizer and exposes the two
//! directions callers usually need: continuous frames to discrete codes and
//! back. The tensor variants accept and return candle tensors on whatever
//! device the input lives on.

use std::path::Path;

use candle_core::Tensor;

use crate::checkpoint;
use crate::config::QuantizerConfig;
use crate::frames::{Codes, Frames};
use crate::quantizer::{QuantizedOutput, ResidualQuantizer};
use crate::{Error, Result};

pub struct Codec {
    config: QuantizerConfig,
    quantizer: ResidualQuantizer,
}

impl Codec {
    /// Freshly initialised codec. Deterministic when `config.seed` is set.
    pub fn new(config: QuantizerConfig) -> Result<Self> {
        let quantizer = ResidualQuantizer::new(&config)?;
        tracing::info!(
            "RVQ codec: {} stages x {} codes, input_dim={}, latent_dim={}",
            config.n_codebooks,
            config.codebook_size,
            config.input_dim,
            config.latent_dim()
        );
        Ok(Self { config, quantizer })
    }

    /// Codec with weights read from a safetensors checkpoint.
    pub fn load(config: QuantizerConfig, path: impl AsRef<Path>) -> Result<Self> {
        let quantizer = checkpoint::load(&config, path)?;
        Ok(Self { config, quantizer })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::save(&self.quantizer, path)
    }

    pub fn config(&self) -> &QuantizerConfig {
        &self.config
    }

    pub fn quantizer(&self) -> &ResidualQuantizer {
        &self.quantizer
    }

    pub fn quantizer_mut(&mut self) -> &mut ResidualQuantizer {
        &mut self.quantizer
    }

    /// Full inference pass, keeping everything the quantizer produces.
    pub fn quantize(&self, z: &Frames, n_quantizers: Option<usize>) -> Result<QuantizedOutput> {
        self.quantizer.encode(z, n_quantizers)
    }

    /// `[batch, input_dim, time]` frames to `[batch, N, time]` codes.
    pub fn encode(&self, z: &Frames) -> Result<Codes> {
        Ok(self.quantizer.encode(z, None)?.codes)
    }

    /// Codes for a prefix of the stages back to `[batch, input_dim, time]`.
    pub fn decode(&self, codes: &Codes) -> Result<Frames> {
        Ok(self.quantizer.from_codes(codes)?.quantized)
    }

    /// Tensor form of [`Codec::encode`]; returns a `u32` tensor.
    pub fn encode_tensor(&self, z: &Tensor) -> Result<Tensor> {
        let codes = self.encode(&Frames::from_tensor(z)?)?;
        codes.to_tensor(z.device())
    }

    /// Tensor form of [`Codec::decode`]; returns an `f32` tensor.
    pub fn decode_tensor(&self, codes: &Tensor) -> Result<Tensor> {
        let frames = self.decode(&Codes::from_tensor(codes)?)?;
        frames.to_tensor(codes.device())
    }

    /// Reconstruction from concatenated stage latents, `[batch, sum(cd), time]`.
    pub fn decode_latents(&self, latents: &Frames) -> Result<Frames> {
        if latents.channels() < self.config.latent_dim() {
            tracing::warn!(
                "latents carry {} of {} channels, decoding a stage prefix",
                latents.channels(),
                self.config.latent_dim()
            );
        }
        Ok(self.quantizer.from_latents(latents)?.quantized)
    }

    /// Reject frames this codec cannot encode before doing any work.
    pub fn check_input(&self, z: &Frames) -> Result<()> {
        if z.channels() != self.config.input_dim {
            return Err(Error::Shape(format!(
                "codec expects {} channels, got {}",
                self.config.input_dim,
                z.channels()
            )));
        }
        Ok(())
    }
}
