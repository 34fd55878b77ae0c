//! Residual vector quantization (SoundStream).
//!
//! Each stage quantizes what the previous stages left unexplained; decoding
//! sums the stage contributions. During training a slice of the batch can
//! be restricted to a random number of leading stages (quantizer dropout)
//! so the codec stays usable with fewer stages at inference time.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::vector::{StageOutput, VectorQuantizer};
use crate::config::{LossWeights, QuantizerConfig};
use crate::frames::{Codes, Frames};
use crate::{Error, Result};

/// Scalar VQ losses, already reduced over the batch and summed over stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VqLosses {
    pub commitment: f32,
    pub codebook: f32,
}

impl VqLosses {
    /// `commitment * w.commitment + codebook * w.codebook`.
    pub fn weighted(&self, weights: &LossWeights) -> f32 {
        self.commitment * weights.commitment + self.codebook * weights.codebook
    }
}

/// Result of a full residual encode.
#[derive(Debug, Clone)]
pub struct QuantizedOutput {
    /// Sum of the active stage outputs, `[batch, input_dim, time]`.
    pub quantized: Frames,
    /// `[batch, N, time]`; always covers every stage.
    pub codes: Codes,
    /// Concatenated per-stage `z_e`, `[batch, sum(codebook_dim), time]`.
    pub latents: Frames,
    /// Present on the training path only.
    pub losses: Option<VqLosses>,
    /// Per-sample index of the last active stage (`active count - 1`).
    pub active_stages: Vec<usize>,
}

impl QuantizedOutput {
    /// Mean of [`QuantizedOutput::active_stages`] over the batch.
    pub fn mean_active_stages(&self) -> f32 {
        if self.active_stages.is_empty() {
            return 0.0;
        }
        self.active_stages.iter().sum::<usize>() as f32 / self.active_stages.len() as f32
    }
}

/// Result of decoding codes or latents without running the encoder.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// `[batch, input_dim, time]`.
    pub quantized: Frames,
    /// Codebook-space vectors of every decoded stage, concatenated.
    pub latents: Frames,
    pub codes: Codes,
}

/// Ordered stack of [`VectorQuantizer`] stages.
#[derive(Debug, Clone)]
pub struct ResidualQuantizer {
    quantizers: Vec<VectorQuantizer>,
    quantizer_dropout: f64,
    rng: ChaCha8Rng,
}

impl ResidualQuantizer {
    /// Randomly initialised quantizer for `cfg`.
    pub fn new(cfg: &QuantizerConfig) -> Result<Self> {
        cfg.validate()?;
        let mut rng = seeded_rng(cfg.seed);
        let quantizers = cfg
            .codebook_dims()
            .into_iter()
            .map(|dim| {
                VectorQuantizer::new(
                    cfg.input_dim,
                    cfg.codebook_size,
                    dim,
                    cfg.stale_tolerance,
                    &mut rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(quantizers, cfg.quantizer_dropout, rng)
    }

    /// Stack existing stages. All stages must share `input_dim` and
    /// `codebook_size`.
    pub fn from_quantizers(
        quantizers: Vec<VectorQuantizer>,
        quantizer_dropout: f64,
        seed: Option<u64>,
    ) -> Result<Self> {
        Self::assemble(quantizers, quantizer_dropout, seeded_rng(seed))
    }

    fn assemble(
        quantizers: Vec<VectorQuantizer>,
        quantizer_dropout: f64,
        rng: ChaCha8Rng,
    ) -> Result<Self> {
        let Some(first) = quantizers.first() else {
            return Err(Error::Config("at least one quantizer stage is required".into()));
        };
        let (input_dim, codebook_size) = (first.input_dim(), first.codebook_size());
        for (i, q) in quantizers.iter().enumerate() {
            if q.input_dim() != input_dim || q.codebook_size() != codebook_size {
                return Err(Error::Config(format!(
                    "stage {i} is {}-wide with {} entries, stage 0 is {input_dim}-wide with {codebook_size}",
                    q.input_dim(),
                    q.codebook_size()
                )));
            }
        }
        if !(0.0..=1.0).contains(&quantizer_dropout) {
            return Err(Error::Config(format!(
                "quantizer_dropout must be in [0, 1], got {quantizer_dropout}"
            )));
        }
        Ok(Self {
            quantizers,
            quantizer_dropout,
            rng,
        })
    }

    /// Restart the training RNG.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    pub fn n_codebooks(&self) -> usize {
        self.quantizers.len()
    }

    pub fn input_dim(&self) -> usize {
        self.quantizers[0].input_dim()
    }

    pub fn codebook_size(&self) -> usize {
        self.quantizers[0].codebook_size()
    }

    pub fn codebook_dims(&self) -> Vec<usize> {
        self.quantizers.iter().map(|q| q.codebook_dim()).collect()
    }

    pub fn quantizer_dropout(&self) -> f64 {
        self.quantizer_dropout
    }

    pub fn quantizers(&self) -> &[VectorQuantizer] {
        &self.quantizers
    }

    fn check_input(&self, z: &Frames) -> Result<()> {
        if z.channels() != self.input_dim() {
            return Err(Error::Shape(format!(
                "quantizer expects {} input channels, got {}",
                self.input_dim(),
                z.channels()
            )));
        }
        Ok(())
    }

    /// Inference encode of `z: [batch, input_dim, time]`.
    ///
    /// Every sample uses `n_quantizers` stages (all stages when `None`),
    /// clamped to `[1, N]`. Codes and latents are produced for all stages
    /// regardless; only the summed output depends on the count.
    pub fn encode(&self, z: &Frames, n_quantizers: Option<usize>) -> Result<QuantizedOutput> {
        self.check_input(z)?;
        let n = self.n_codebooks();
        let active = vec![n_quantizers.unwrap_or(n).clamp(1, n); z.batch()];
        tracing::debug!(
            "RVQ encode: batch={} time={} stages={n} active={}",
            z.batch(),
            z.time(),
            active.first().copied().unwrap_or(n)
        );

        let mut residual = z.clone();
        let mut acc = Accumulator::new(z, n);
        for (i, q) in self.quantizers.iter().enumerate() {
            let stage = q.encode(&residual).map_err(|e| e.in_stage(i))?;
            residual.sub_assign(&stage.quantized)?;
            acc.push(i, &active, stage)?;
        }
        acc.finish(&active, n, None)
    }

    /// Training encode: per-stage losses, stale tracking and dead-code
    /// revival, with quantizer dropout applied to the active-stage counts.
    pub fn train_forward(&mut self, z: &Frames) -> Result<QuantizedOutput> {
        self.check_input(z)?;
        let n = self.n_codebooks();
        let batch = z.batch();
        let active = self.training_active_counts(batch);

        let mut residual = z.clone();
        let mut acc = Accumulator::new(z, n);
        let mut losses = VqLosses {
            commitment: 0.0,
            codebook: 0.0,
        };
        for (i, q) in self.quantizers.iter_mut().enumerate() {
            let out = q
                .train_forward(&residual, &mut self.rng)
                .map_err(|e| e.in_stage(i))?;
            residual.sub_assign(&out.stage.quantized)?;

            let mask = stage_mask(i, &active);
            losses.commitment += masked_mean(&out.commitment_loss, &mask);
            losses.codebook += masked_mean(&out.codebook_loss, &mask);
            acc.push(i, &active, out.stage)?;
        }
        tracing::debug!(
            "RVQ train step: batch={batch} commitment={:.5} codebook={:.5}",
            losses.commitment,
            losses.codebook
        );
        acc.finish(&active, n, Some(losses))
    }

    /// Active-stage count per sample for one training batch.
    ///
    /// The first `floor(batch * quantizer_dropout)` samples draw a count
    /// uniformly from `[1, N]`; the rest get `N + 1`, which masks in every
    /// stage.
    fn training_active_counts(&mut self, batch: usize) -> Vec<usize> {
        let n = self.n_codebooks();
        let mut counts = vec![n + 1; batch];
        let n_dropout = (batch as f64 * self.quantizer_dropout) as usize;
        for count in counts.iter_mut().take(n_dropout) {
            *count = self.rng.random_range(1..=n);
        }
        counts
    }

    /// Decode `[batch, n, time]` codes, `n <= N`, using the first `n` stages.
    pub fn from_codes(&self, codes: &Codes) -> Result<Decoded> {
        let (batch, n_codes, time) = codes.dims();
        if n_codes == 0 || n_codes > self.n_codebooks() {
            return Err(Error::Shape(format!(
                "codes cover {n_codes} stages, quantizer has {}",
                self.n_codebooks()
            )));
        }
        let mut quantized = Frames::zeros(batch, self.input_dim(), time);
        let mut latents = Vec::with_capacity(n_codes);
        for (i, q) in self.quantizers.iter().take(n_codes).enumerate() {
            let z_p = q
                .decode_code(&codes.stage(i), batch, time)
                .map_err(|e| e.in_stage(i))?;
            quantized.add_assign(&q.project_out(&z_p)?)?;
            latents.push(z_p);
        }
        Ok(Decoded {
            quantized,
            latents: Frames::cat_channels(&latents)?,
            codes: codes.clone(),
        })
    }

    /// Re-quantize projected latents covering a prefix of the stages.
    ///
    /// Only stages whose whole `codebook_dim` slice fits in the provided
    /// channel count are decoded; trailing channels are ignored.
    pub fn from_latents(&self, latents: &Frames) -> Result<Decoded> {
        let (batch, channels, time) = latents.dims();
        let dims = self.codebook_dims();
        let n_stages = stages_covered(&dims, channels);
        if n_stages == 0 {
            return Err(Error::Shape(format!(
                "{channels} latent channels cover no stage (first stage needs {})",
                dims[0]
            )));
        }

        let mut quantized = Frames::zeros(batch, self.input_dim(), time);
        let mut z_ps = Vec::with_capacity(n_stages);
        let mut indices = Vec::with_capacity(n_stages);
        let mut offset = 0;
        for (i, q) in self.quantizers.iter().take(n_stages).enumerate() {
            let slice = latents.narrow_channels(offset, dims[i])?;
            offset += dims[i];
            let (z_p, codes_i) = q.decode_latents(&slice).map_err(|e| e.in_stage(i))?;
            quantized.add_assign(&q.project_out(&z_p)?)?;
            z_ps.push(z_p);
            indices.push(codes_i);
        }
        Ok(Decoded {
            quantized,
            latents: Frames::cat_channels(&z_ps)?,
            codes: Codes::from_stages(&indices, batch, time)?,
        })
    }
}

/// Number of leading stages whose cumulative width fits in `channels`.
fn stages_covered(dims: &[usize], channels: usize) -> usize {
    let mut end = 0;
    let mut covered = 0;
    for &d in dims {
        end += d;
        if end > channels {
            break;
        }
        covered += 1;
    }
    covered
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_os_rng(),
    }
}

fn stage_mask(stage: usize, active: &[usize]) -> Vec<bool> {
    active.iter().map(|&count| stage < count).collect()
}

/// `mean(values * mask)` over the whole batch.
fn masked_mean(values: &[f32], mask: &[bool]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f32 = values
        .iter()
        .zip(mask)
        .filter(|(_, on)| **on)
        .map(|(v, _)| v)
        .sum();
    sum / values.len() as f32
}

/// Running sums shared by the inference and training encode loops.
struct Accumulator {
    quantized: Frames,
    indices: Vec<Vec<u32>>,
    latents: Vec<Frames>,
}

impl Accumulator {
    fn new(z: &Frames, n_stages: usize) -> Self {
        let (batch, channels, time) = z.dims();
        Self {
            quantized: Frames::zeros(batch, channels, time),
            indices: Vec::with_capacity(n_stages),
            latents: Vec::with_capacity(n_stages),
        }
    }

    fn push(&mut self, stage: usize, active: &[usize], out: StageOutput) -> Result<()> {
        self.quantized
            .add_masked(&out.quantized, &stage_mask(stage, active))?;
        self.indices.push(out.indices);
        self.latents.push(out.latents);
        Ok(())
    }

    fn finish(
        self,
        active: &[usize],
        n_stages: usize,
        losses: Option<VqLosses>,
    ) -> Result<QuantizedOutput> {
        let (batch, _, time) = self.quantized.dims();
        Ok(QuantizedOutput {
            quantized: self.quantized,
            codes: Codes::from_stages(&self.indices, batch, time)?,
            latents: Frames::cat_channels(&self.latents)?,
            losses,
            active_stages: active.iter().map(|&c| c.min(n_stages) - 1).collect(),
        })
    }
}
