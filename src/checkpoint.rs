//! Safetensors persistence of quantizer parameters.
//!
//! Tensor names follow the module layout of the trained checkpoints:
//!
//! ```text
//! quantizers.{i}.in_proj.{weight_g, weight_v, bias}    [cd, 1, 1] [cd, D, 1] [cd]
//! quantizers.{i}.out_proj.{weight_g, weight_v, bias}   [D, 1, 1]  [D, cd, 1] [D]
//! quantizers.{i}.codebook.weight                       [codebook_size, cd]
//! quantizers.{i}.stale_counter                         [codebook_size]
//! ```
//!
//! `stale_counter` is optional on load; counters start at zero when absent.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::QuantizerConfig;
use crate::quantizer::{Codebook, Projection, ResidualQuantizer, StaleTracker, VectorQuantizer};
use crate::{Error, Result};

/// Collect every parameter of `rq` into named CPU tensors.
pub fn state_dict(rq: &ResidualQuantizer) -> Result<HashMap<String, Tensor>> {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    for (i, q) in rq.quantizers().iter().enumerate() {
        let prefix = format!("quantizers.{i}");
        q.in_proj()
            .export(&format!("{prefix}.in_proj"), &mut tensors, &device)?;
        q.out_proj()
            .export(&format!("{prefix}.out_proj"), &mut tensors, &device)?;

        let codebook = q.codebook();
        tensors.insert(
            format!("{prefix}.codebook.weight"),
            Tensor::from_slice(codebook.entries(), (codebook.size(), codebook.dim()), &device)?,
        );
        let counters: Vec<f32> = q
            .stale_tracker()
            .counters()
            .iter()
            .map(|&c| c as f32)
            .collect();
        tensors.insert(
            format!("{prefix}.stale_counter"),
            Tensor::from_slice(&counters, counters.len(), &device)?,
        );
    }
    Ok(tensors)
}

/// Write `rq` to a safetensors file.
pub fn save(rq: &ResidualQuantizer, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let tensors = state_dict(rq)?;
    tracing::info!(
        "Saving {} tensors ({} stages) to {:?}",
        tensors.len(),
        rq.n_codebooks(),
        path
    );
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Load a quantizer shaped by `cfg` from a safetensors file.
pub fn load(cfg: &QuantizerConfig, path: impl AsRef<Path>) -> Result<ResidualQuantizer> {
    let path = path.as_ref();
    tracing::info!("Loading RVQ weights from {:?}", path);
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &Device::Cpu)
            .map_err(|e| Error::Checkpoint(format!("{}: {e}", path.display())))?
    };
    from_var_builder(cfg, vb)
}

/// Build a quantizer shaped by `cfg` from `vb`.
pub fn from_var_builder(cfg: &QuantizerConfig, vb: VarBuilder) -> Result<ResidualQuantizer> {
    cfg.validate()?;
    let quantizers = cfg
        .codebook_dims()
        .into_iter()
        .enumerate()
        .map(|(i, dim)| {
            load_stage(cfg, dim, vb.pp(format!("quantizers.{i}")))
                .map_err(|e| Error::Checkpoint(format!("stage {i}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    ResidualQuantizer::from_quantizers(quantizers, cfg.quantizer_dropout, cfg.seed)
}

fn load_stage(cfg: &QuantizerConfig, codebook_dim: usize, vb: VarBuilder) -> Result<VectorQuantizer> {
    let in_proj = Projection::load(cfg.input_dim, codebook_dim, vb.pp("in_proj"))?;
    let out_proj = Projection::load(codebook_dim, cfg.input_dim, vb.pp("out_proj"))?;

    let entries = vb
        .get((cfg.codebook_size, codebook_dim), "codebook.weight")?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let codebook = Codebook::new(entries, cfg.codebook_size, codebook_dim)?;

    let stale = if vb.contains_tensor("stale_counter") {
        let counters = vb
            .get(cfg.codebook_size, "stale_counter")?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|c| c.max(0.0) as u32)
            .collect();
        StaleTracker::from_counters(counters, cfg.stale_tolerance)
    } else {
        StaleTracker::new(cfg.codebook_size, cfg.stale_tolerance)
    };

    VectorQuantizer::from_parts(in_proj, out_proj, codebook, stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodebookDim;
    use crate::frames::Frames;

    fn small_config() -> QuantizerConfig {
        QuantizerConfig {
            input_dim: 6,
            n_codebooks: 3,
            codebook_size: 8,
            codebook_dim: CodebookDim::PerStage(vec![2, 3, 2]),
            seed: Some(3),
            stale_tolerance: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_state_dict_names_and_shapes() {
        let rq = ResidualQuantizer::new(&small_config()).unwrap();
        let sd = state_dict(&rq).unwrap();
        assert_eq!(sd.len(), 3 * 8);
        assert_eq!(sd["quantizers.1.codebook.weight"].dims(), &[8, 3]);
        assert_eq!(sd["quantizers.1.in_proj.weight_v"].dims(), &[3, 6, 1]);
        assert_eq!(sd["quantizers.1.out_proj.weight_v"].dims(), &[6, 3, 1]);
        assert_eq!(sd["quantizers.2.out_proj.weight_g"].dims(), &[6, 1, 1]);
        assert_eq!(sd["quantizers.0.stale_counter"].dims(), &[8]);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let cfg = small_config();
        let mut rq = ResidualQuantizer::new(&cfg).unwrap();
        let data = (0..2 * 6 * 4).map(|i| (i as f32 * 0.37).sin()).collect();
        let z = Frames::new(data, 2, 6, 4).unwrap();
        // Age the stale counters so they have something to persist.
        rq.train_forward(&z).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rvq.safetensors");
        save(&rq, &path).unwrap();
        let loaded = load(&cfg, &path).unwrap();

        for (a, b) in rq.quantizers().iter().zip(loaded.quantizers()) {
            assert_eq!(a.codebook(), b.codebook());
            assert_eq!(a.stale_tracker(), b.stale_tracker());
            assert_eq!(a.in_proj().bias(), b.in_proj().bias());
        }
        let before = rq.encode(&z, None).unwrap();
        let after = loaded.encode(&z, None).unwrap();
        assert_eq!(before.codes, after.codes);
        assert!(before.quantized.max_abs_diff(&after.quantized).unwrap() < 1e-4);
    }

    #[test]
    fn test_load_without_stale_counters() {
        let cfg = small_config();
        let rq = ResidualQuantizer::new(&cfg).unwrap();
        let mut sd = state_dict(&rq).unwrap();
        sd.retain(|name, _| !name.ends_with("stale_counter"));
        let vb = VarBuilder::from_tensors(sd, DType::F32, &Device::Cpu);
        let loaded = from_var_builder(&cfg, vb).unwrap();
        assert!(loaded.quantizers()[0]
            .stale_tracker()
            .counters()
            .iter()
            .all(|&c| c == 0));
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let cfg = small_config();
        let rq = ResidualQuantizer::new(&cfg).unwrap();
        let vb = VarBuilder::from_tensors(state_dict(&rq).unwrap(), DType::F32, &Device::Cpu);
        let wrong = QuantizerConfig {
            codebook_size: 16,
            ..cfg
        };
        assert!(matches!(
            from_var_builder(&wrong, vb),
            Err(Error::Checkpoint(_))
        ));
    }
}
