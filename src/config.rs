//! Configuration for the residual vector quantizer.
//!
//! Defaults match the SoundStream/DAC-style quantizer the checkpoints were
//! trained with: 9 stages of 1024 entries, 8-wide codebooks over a 512-wide
//! input.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Per-stage codebook width: either one width shared by every stage or an
/// explicit list with one entry per stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodebookDim {
    Uniform(usize),
    PerStage(Vec<usize>),
}

impl Default for CodebookDim {
    fn default() -> Self {
        CodebookDim::Uniform(8)
    }
}

/// Weights applied to the two VQ losses when folding them into one scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    #[serde(default = "default_commitment_weight")]
    pub commitment: f32,
    #[serde(default = "default_codebook_weight")]
    pub codebook: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            commitment: default_commitment_weight(),
            codebook: default_codebook_weight(),
        }
    }
}

/// Top-level quantizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizerConfig {
    /// Width of the continuous embeddings fed to the codec.
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,

    /// Number of residual stages (N).
    #[serde(default = "default_n_codebooks")]
    pub n_codebooks: usize,

    /// Entries per codebook.
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,

    #[serde(default)]
    pub codebook_dim: CodebookDim,

    /// Fraction of a training batch that gets a random number of active stages.
    #[serde(default)]
    pub quantizer_dropout: f64,

    /// Consecutive unused batches before a codebook entry is replaced.
    #[serde(default = "default_stale_tolerance")]
    pub stale_tolerance: u32,

    /// Seed for the training RNG (dropout counts, revival sampling).
    /// `None` seeds from the OS.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub loss_weights: LossWeights,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            input_dim: default_input_dim(),
            n_codebooks: default_n_codebooks(),
            codebook_size: default_codebook_size(),
            codebook_dim: CodebookDim::default(),
            quantizer_dropout: 0.0,
            stale_tolerance: default_stale_tolerance(),
            seed: None,
            loss_weights: LossWeights::default(),
        }
    }
}

impl QuantizerConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Codebook width of every stage, in stage order.
    pub fn codebook_dims(&self) -> Vec<usize> {
        match &self.codebook_dim {
            CodebookDim::Uniform(d) => vec![*d; self.n_codebooks],
            CodebookDim::PerStage(dims) => dims.clone(),
        }
    }

    /// Total channel count of the concatenated per-stage latents.
    pub fn latent_dim(&self) -> usize {
        self.codebook_dims().iter().sum()
    }

    /// Reject configurations the quantizer cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::Config("input_dim must be > 0".into()));
        }
        if self.n_codebooks == 0 {
            return Err(Error::Config("n_codebooks must be > 0".into()));
        }
        if self.codebook_size == 0 {
            return Err(Error::Config("codebook_size must be > 0".into()));
        }
        if self.codebook_size > u32::MAX as usize {
            return Err(Error::Config(format!(
                "codebook_size {} does not fit a u32 code",
                self.codebook_size
            )));
        }
        let dims = self.codebook_dims();
        if dims.len() != self.n_codebooks {
            return Err(Error::Config(format!(
                "codebook_dim lists {} stages but n_codebooks is {}",
                dims.len(),
                self.n_codebooks
            )));
        }
        if let Some(stage) = dims.iter().position(|&d| d == 0) {
            return Err(Error::Config(format!("codebook_dim of stage {stage} is 0")));
        }
        if !(0.0..=1.0).contains(&self.quantizer_dropout) {
            return Err(Error::Config(format!(
                "quantizer_dropout must be in [0, 1], got {}",
                self.quantizer_dropout
            )));
        }
        if self.stale_tolerance == 0 {
            return Err(Error::Config("stale_tolerance must be > 0".into()));
        }
        Ok(())
    }
}

fn default_input_dim() -> usize {
    512
}

fn default_n_codebooks() -> usize {
    9
}

fn default_codebook_size() -> usize {
    1024
}

fn default_stale_tolerance() -> u32 {
    100
}

fn default_commitment_weight() -> f32 {
    0.25
}

fn default_codebook_weight() -> f32 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = QuantizerConfig::default();
        assert_eq!(cfg.input_dim, 512);
        assert_eq!(cfg.n_codebooks, 9);
        assert_eq!(cfg.codebook_size, 1024);
        assert_eq!(cfg.codebook_dims(), vec![8; 9]);
        assert_eq!(cfg.latent_dim(), 72);
        assert_eq!(cfg.stale_tolerance, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_codebook_dim_accepts_int_or_list() {
        let cfg: QuantizerConfig =
            serde_json::from_str(r#"{"n_codebooks": 3, "codebook_dim": 16}"#).unwrap();
        assert_eq!(cfg.codebook_dims(), vec![16, 16, 16]);

        let cfg: QuantizerConfig =
            serde_json::from_str(r#"{"n_codebooks": 3, "codebook_dim": [4, 8, 12]}"#).unwrap();
        assert_eq!(cfg.codebook_dims(), vec![4, 8, 12]);
        assert_eq!(cfg.latent_dim(), 24);
        // Unspecified fields fall back to defaults.
        assert_eq!(cfg.codebook_size, 1024);
        assert_eq!(cfg.loss_weights, LossWeights::default());
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let cfg = QuantizerConfig {
            n_codebooks: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let cfg = QuantizerConfig {
            codebook_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let cfg = QuantizerConfig {
            codebook_dim: CodebookDim::PerStage(vec![8, 0]),
            n_codebooks: 2,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_stage_count_mismatch() {
        let cfg = QuantizerConfig {
            n_codebooks: 4,
            codebook_dim: CodebookDim::PerStage(vec![8, 8]),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_dropout_out_of_range() {
        let cfg = QuantizerConfig {
            quantizer_dropout: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = QuantizerConfig {
            quantizer_dropout: 1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rvq.json");
        std::fs::write(
            &path,
            r#"{"input_dim": 120, "n_codebooks": 8, "codebook_size": 1024, "codebook_dim": 16, "quantizer_dropout": 0.0}"#,
        )
        .unwrap();
        let cfg = QuantizerConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.input_dim, 120);
        assert_eq!(cfg.latent_dim(), 128);
    }
}
