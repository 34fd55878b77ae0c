//! Per-frame affine projection (a weight-normed 1x1 `Conv1d`).

use std::collections::HashMap;

use candle_core::{D, Device, Tensor};
use candle_nn::VarBuilder;
use rand::Rng;

use crate::frames::Frames;
use crate::{Error, Result};

/// `y[:, t] = W x[:, t] + b` applied independently at every time step.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Row-major `[out_dim, in_dim]`.
    weight: Vec<f32>,
    bias: Vec<f32>,
    in_dim: usize,
    out_dim: usize,
}

impl Projection {
    pub fn new(weight: Vec<f32>, bias: Vec<f32>, in_dim: usize, out_dim: usize) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::Config(format!(
                "projection dims must be > 0, got {in_dim} -> {out_dim}"
            )));
        }
        if weight.len() != in_dim * out_dim {
            return Err(Error::Shape(format!(
                "projection weight {out_dim}x{in_dim} needs {} values, got {}",
                in_dim * out_dim,
                weight.len()
            )));
        }
        if bias.len() != out_dim {
            return Err(Error::Shape(format!(
                "projection bias needs {out_dim} values, got {}",
                bias.len()
            )));
        }
        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    /// `U(-1/sqrt(in_dim), 1/sqrt(in_dim))` for weight and bias, the
    /// PyTorch `Conv1d` default for a kernel of size 1.
    pub fn random<R: Rng>(in_dim: usize, out_dim: usize, rng: &mut R) -> Result<Self> {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        let weight = (0..in_dim * out_dim)
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        let bias = (0..out_dim)
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        Self::new(weight, bias, in_dim, out_dim)
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// Project `[batch, in_dim, time]` to `[batch, out_dim, time]`.
    pub fn forward(&self, x: &Frames) -> Result<Frames> {
        let (batch, channels, time) = x.dims();
        if channels != self.in_dim {
            return Err(Error::Shape(format!(
                "projection expects {} input channels, got {channels}",
                self.in_dim
            )));
        }
        let mut out = Vec::with_capacity(batch * self.out_dim * time);
        for b in 0..batch {
            let sample = x.sample(b);
            for o in 0..self.out_dim {
                let w = &self.weight[o * self.in_dim..(o + 1) * self.in_dim];
                let mut row = vec![self.bias[o]; time];
                for (i, &wi) in w.iter().enumerate() {
                    let src = &sample[i * time..(i + 1) * time];
                    for (acc, &v) in row.iter_mut().zip(src) {
                        *acc += wi * v;
                    }
                }
                out.extend_from_slice(&row);
            }
        }
        Frames::new(out, batch, self.out_dim, time)
    }

    /// Load from a `WNConv1d(kernel_size=1)` checkpoint entry.
    ///
    /// Weight-norm pairs (`weight_g`, `weight_v`) are folded into a plain
    /// weight as `g * v / |v|`, the norm taken per output channel. A plain
    /// `weight` tensor is accepted as well. All-zero `v` rows fold to zero.
    pub fn load(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = if vb.contains_tensor("weight_v") {
            let g = vb.get((out_dim, 1, 1), "weight_g")?;
            let v = vb.get((out_dim, in_dim, 1), "weight_v")?;
            let norm = v.sqr()?.sum_keepdim((1, 2))?.sqrt()?.maximum(1e-12)?;
            v.broadcast_mul(&g.broadcast_div(&norm)?)?
        } else {
            vb.get((out_dim, in_dim, 1), "weight")?
        };
        let weight = weight.squeeze(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        let bias = vb.get(out_dim, "bias")?.to_vec1::<f32>()?;
        Self::new(weight, bias, in_dim, out_dim)
    }

    /// Write this projection in weight-norm form under `prefix`.
    ///
    /// `weight_g` holds the row norms and `weight_v` the weight itself, so
    /// folding them back reproduces the weight exactly up to rounding.
    pub fn export(
        &self,
        prefix: &str,
        tensors: &mut HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<()> {
        let norms: Vec<f32> = self
            .weight
            .chunks_exact(self.in_dim)
            .map(|row| row.iter().map(|v| v * v).sum::<f32>().sqrt())
            .collect();
        tensors.insert(
            format!("{prefix}.weight_g"),
            Tensor::from_slice(&norms, (self.out_dim, 1, 1), device)?,
        );
        tensors.insert(
            format!("{prefix}.weight_v"),
            Tensor::from_slice(&self.weight, (self.out_dim, self.in_dim, 1), device)?,
        );
        tensors.insert(
            format!("{prefix}.bias"),
            Tensor::from_slice(&self.bias, self.out_dim, device)?,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_forward_applies_per_frame() {
        // W = [[1, 2], [0, -1], [3, 0]], b = [0.5, 0, -1]
        let proj =
            Projection::new(vec![1.0, 2.0, 0.0, -1.0, 3.0, 0.0], vec![0.5, 0.0, -1.0], 2, 3)
                .unwrap();
        // One sample, two frames: x[:, 0] = [1, 1], x[:, 1] = [2, -1]
        let x = Frames::new(vec![1.0, 2.0, 1.0, -1.0], 1, 2, 2).unwrap();
        let y = proj.forward(&x).unwrap();
        assert_eq!(y.dims(), (1, 3, 2));
        assert_eq!(y.as_slice(), &[3.5, 0.5, -1.0, 1.0, 2.0, 5.0]);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let proj = Projection::random(4, 2, &mut rng).unwrap();
        let x = Frames::zeros(1, 3, 5);
        assert!(matches!(proj.forward(&x), Err(Error::Shape(_))));
    }

    #[test]
    fn test_random_init_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let proj = Projection::random(16, 4, &mut rng).unwrap();
        assert!(proj.weight().iter().all(|w| w.abs() <= 0.25));
        assert!(proj.bias().iter().all(|b| b.abs() <= 0.25));
    }

    #[test]
    fn test_load_folds_weight_norm() {
        let dev = Device::Cpu;
        let mut ts = HashMap::new();
        // v rows [3, 4] and [0, 2]; g = [10, 1] -> W = [[6, 8], [0, 1]]
        ts.insert(
            "p.weight_v".to_string(),
            Tensor::new(&[[[3f32], [4.0]], [[0.0], [2.0]]], &dev).unwrap(),
        );
        ts.insert(
            "p.weight_g".to_string(),
            Tensor::new(&[[[10f32]], [[1.0]]], &dev).unwrap(),
        );
        ts.insert("p.bias".to_string(), Tensor::new(&[0.5f32, -0.5], &dev).unwrap());
        let vb = VarBuilder::from_tensors(ts, DType::F32, &dev);
        let proj = Projection::load(2, 2, vb.pp("p")).unwrap();
        let expected = [6.0f32, 8.0, 0.0, 1.0];
        for (w, e) in proj.weight().iter().zip(expected) {
            assert!((w - e).abs() < 1e-5, "{w} vs {e}");
        }
        assert_eq!(proj.bias(), &[0.5, -0.5]);
    }

    #[test]
    fn test_export_then_load_preserves_weights() {
        let dev = Device::Cpu;
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let proj = Projection::random(5, 3, &mut rng).unwrap();
        let mut ts = HashMap::new();
        proj.export("out_proj", &mut ts, &dev).unwrap();
        let vb = VarBuilder::from_tensors(ts, DType::F32, &dev);
        let loaded = Projection::load(5, 3, vb.pp("out_proj")).unwrap();
        for (a, b) in loaded.weight().iter().zip(proj.weight()) {
            assert!((a - b).abs() < 1e-5);
        }
        assert_eq!(loaded.bias(), proj.bias());
    }
}
