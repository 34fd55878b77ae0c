//! Single-stage vector quantizer.
//!
//! Uses the two tricks from Improved VQGAN:
//! 1. Factorized codes: the nearest-neighbour lookup runs in a low-dimensional
//!    space reached through `in_proj`.
//! 2. L2-normalized codes: Euclidean search over unit vectors, i.e. cosine
//!    similarity.
//!
//! [`VectorQuantizer::encode`] is the inference path and never mutates
//! state. [`VectorQuantizer::train_forward`] additionally computes the VQ
//! losses and runs dead-code revival.

use rand::Rng;

use super::codebook::{Codebook, l2_normalize_rows};
use super::projection::Projection;
use super::stale::StaleTracker;
use crate::frames::Frames;
use crate::{Error, Result};

/// Output of one stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Quantized vectors in the input space, `[batch, input_dim, time]`.
    pub quantized: Frames,
    /// Selected entries in `(b t)` order.
    pub indices: Vec<u32>,
    /// Projected input before quantization (`z_e`), `[batch, codebook_dim, time]`.
    pub latents: Frames,
}

/// Training-path output of one stage.
#[derive(Debug, Clone)]
pub struct TrainingStageOutput {
    pub stage: StageOutput,
    /// Per-sample `mse(z_e, sg(z_q))`.
    pub commitment_loss: Vec<f32>,
    /// Per-sample `mse(z_q, sg(z_e))`.
    pub codebook_loss: Vec<f32>,
    /// Entries replaced by dead-code revival in this step.
    pub revived: usize,
}

/// One quantizer stage: `in_proj -> codebook search -> out_proj`.
#[derive(Debug, Clone)]
pub struct VectorQuantizer {
    in_proj: Projection,
    out_proj: Projection,
    codebook: Codebook,
    stale: StaleTracker,
}

impl VectorQuantizer {
    /// Freshly initialised stage.
    pub fn new<R: Rng>(
        input_dim: usize,
        codebook_size: usize,
        codebook_dim: usize,
        stale_tolerance: u32,
        rng: &mut R,
    ) -> Result<Self> {
        let in_proj = Projection::random(input_dim, codebook_dim, rng)?;
        let out_proj = Projection::random(codebook_dim, input_dim, rng)?;
        let codebook = Codebook::random(codebook_size, codebook_dim, rng)?;
        let stale = StaleTracker::new(codebook_size, stale_tolerance);
        Self::from_parts(in_proj, out_proj, codebook, stale)
    }

    /// Assemble a stage from existing parameters, checking that the shapes agree.
    pub fn from_parts(
        in_proj: Projection,
        out_proj: Projection,
        codebook: Codebook,
        stale: StaleTracker,
    ) -> Result<Self> {
        if in_proj.out_dim() != codebook.dim() || out_proj.in_dim() != codebook.dim() {
            return Err(Error::Config(format!(
                "projections {}->{} / {}->{} do not match codebook dim {}",
                in_proj.in_dim(),
                in_proj.out_dim(),
                out_proj.in_dim(),
                out_proj.out_dim(),
                codebook.dim()
            )));
        }
        if in_proj.in_dim() != out_proj.out_dim() {
            return Err(Error::Config(format!(
                "in_proj reads {} channels but out_proj writes {}",
                in_proj.in_dim(),
                out_proj.out_dim()
            )));
        }
        if stale.counters().len() != codebook.size() {
            return Err(Error::Config(format!(
                "{} stale counters for {} codebook entries",
                stale.counters().len(),
                codebook.size()
            )));
        }
        Ok(Self {
            in_proj,
            out_proj,
            codebook,
            stale,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.in_proj.in_dim()
    }

    pub fn codebook_dim(&self) -> usize {
        self.codebook.dim()
    }

    pub fn codebook_size(&self) -> usize {
        self.codebook.size()
    }

    pub fn codebook(&self) -> &Codebook {
        &self.codebook
    }

    pub fn in_proj(&self) -> &Projection {
        &self.in_proj
    }

    pub fn out_proj(&self) -> &Projection {
        &self.out_proj
    }

    pub fn stale_tracker(&self) -> &StaleTracker {
        &self.stale
    }

    /// Inference forward: `(quantized, indices, z_e)` for `z: [batch, input_dim, time]`.
    pub fn encode(&self, z: &Frames) -> Result<StageOutput> {
        let z_e = self.in_proj.forward(z)?;
        let (z_q, indices) = self.decode_latents(&z_e)?;
        let quantized = self.out_proj.forward(&z_q)?;
        Ok(StageOutput {
            quantized,
            indices,
            latents: z_e,
        })
    }

    /// Training forward: the inference path plus losses, usage bookkeeping
    /// and revival of dead entries.
    ///
    /// Without autodiff the straight-through value `z_e + (z_q - z_e)` is
    /// just `z_q`, so the quantized output equals the inference output for
    /// the codebook as it was before revival.
    pub fn train_forward<R: Rng>(&mut self, z: &Frames, rng: &mut R) -> Result<TrainingStageOutput> {
        let z_e = self.in_proj.forward(z)?;
        let (batch, codebook_dim, time) = z_e.dims();

        let mut encodings = z_e.to_encodings();
        let floored = l2_normalize_rows(&mut encodings, codebook_dim);
        if floored > 0 {
            tracing::warn!("{floored} zero-norm encodings floored before codebook search");
        }
        let indices = self.codebook.nearest(&encodings);
        let z_q = self.decode_code(&indices, batch, time)?;

        self.record_usage(&indices);
        let revived = self.maybe_revive(&encodings, rng)?;

        let (commitment_loss, codebook_loss) = losses(&z_e, &z_q)?;
        let quantized = self.out_proj.forward(&z_q)?;
        Ok(TrainingStageOutput {
            stage: StageOutput {
                quantized,
                indices,
                latents: z_e,
            },
            commitment_loss,
            codebook_loss,
            revived,
        })
    }

    /// Nearest-entry search on already projected latents
    /// (`[batch, codebook_dim, time]`). Returns the codebook-space quantized
    /// vectors and the indices in `(b t)` order.
    pub fn decode_latents(&self, z_e: &Frames) -> Result<(Frames, Vec<u32>)> {
        let (batch, channels, time) = z_e.dims();
        if channels != self.codebook.dim() {
            return Err(Error::Shape(format!(
                "latents have {channels} channels, codebook dim is {}",
                self.codebook.dim()
            )));
        }
        let mut encodings = z_e.to_encodings();
        l2_normalize_rows(&mut encodings, channels);
        let indices = self.codebook.nearest(&encodings);
        let z_q = self.decode_code(&indices, batch, time)?;
        Ok((z_q, indices))
    }

    /// Table lookup of `indices` (`(b t)` order) into `[batch, codebook_dim, time]`.
    pub fn decode_code(&self, indices: &[u32], batch: usize, time: usize) -> Result<Frames> {
        if indices.len() != batch * time {
            return Err(Error::Shape(format!(
                "{} indices for batch {batch} x time {time}",
                indices.len()
            )));
        }
        let rows = self.codebook.lookup(indices)?;
        Frames::from_encodings(&rows, batch, self.codebook.dim(), time)
    }

    /// Project codebook-space vectors back to the input space.
    pub fn project_out(&self, z_q: &Frames) -> Result<Frames> {
        self.out_proj.forward(z_q)
    }

    /// Advance the stale counters with one batch of selected indices.
    pub fn record_usage(&mut self, indices: &[u32]) {
        self.stale.record_usage(indices);
    }

    /// Replace entries whose stale counter reached the tolerance with rows
    /// of `encodings` (normalized, `(b t) x codebook_dim`).
    pub fn maybe_revive<R: Rng>(&mut self, encodings: &[f32], rng: &mut R) -> Result<usize> {
        let revived = self.stale.revive(&mut self.codebook, encodings, rng)?;
        if revived > 0 {
            tracing::info!("Replace {revived} codes");
        }
        Ok(revived)
    }
}

/// Per-sample commitment and codebook losses.
///
/// Both are `mean((z_e - z_q)^2)` over codebook dim and time; they differ
/// only in which side gradients would flow to, so their values coincide.
pub fn losses(z_e: &Frames, z_q: &Frames) -> Result<(Vec<f32>, Vec<f32>)> {
    if z_e.dims() != z_q.dims() {
        return Err(Error::Shape(format!(
            "loss inputs differ: {:?} vs {:?}",
            z_e.dims(),
            z_q.dims()
        )));
    }
    let (batch, channels, time) = z_e.dims();
    let count = (channels * time).max(1) as f32;
    let per_sample: Vec<f32> = (0..batch)
        .map(|b| {
            z_e.sample(b)
                .iter()
                .zip(z_q.sample(b))
                .map(|(e, q)| (e - q) * (e - q))
                .sum::<f32>()
                / count
        })
        .collect();
    Ok((per_sample.clone(), per_sample))
}
