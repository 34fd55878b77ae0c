//! Learned codebook and cosine nearest-neighbour search.
//!
//! Encodings and entries are both L2-normalized before the distance
//! computation (ViT-VQGAN trick), so the Euclidean search below is
//! equivalent to picking the entry with the highest cosine similarity.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::{Error, Result};

/// Norm floor used when normalizing, matching `F.normalize(eps=1e-12)`.
pub const NORM_EPS: f32 = 1e-12;

/// Normalize each `dim`-wide row of `rows` to unit length in place.
///
/// Rows whose norm is below [`NORM_EPS`] are divided by the floor instead,
/// which leaves an all-zero row at zero. Returns the number of floored rows.
pub fn l2_normalize_rows(rows: &mut [f32], dim: usize) -> usize {
    let mut floored = 0;
    for row in rows.chunks_exact_mut(dim) {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        let denom = if norm < NORM_EPS {
            floored += 1;
            NORM_EPS
        } else {
            norm
        };
        for v in row.iter_mut() {
            *v /= denom;
        }
    }
    floored
}

/// `size x dim` table of code vectors, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Codebook {
    entries: Vec<f32>,
    size: usize,
    dim: usize,
}

impl Codebook {
    pub fn new(entries: Vec<f32>, size: usize, dim: usize) -> Result<Self> {
        if size == 0 || dim == 0 {
            return Err(Error::Config(format!(
                "codebook must be non-empty, got {size}x{dim}"
            )));
        }
        if entries.len() != size * dim {
            return Err(Error::Shape(format!(
                "codebook {size}x{dim} needs {} values, got {}",
                size * dim,
                entries.len()
            )));
        }
        Ok(Self { entries, size, dim })
    }

    /// Entries drawn from N(0, 1), the default embedding initialisation.
    pub fn random<R: Rng>(size: usize, dim: usize, rng: &mut R) -> Result<Self> {
        let entries = (0..size * dim)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Self::new(entries, size, dim)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn entries(&self) -> &[f32] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> &[f32] {
        &self.entries[index * self.dim..(index + 1) * self.dim]
    }

    /// Unit-norm copy of the table.
    pub fn normalized(&self) -> Vec<f32> {
        let mut rows = self.entries.clone();
        l2_normalize_rows(&mut rows, self.dim);
        rows
    }

    /// Index of the nearest entry for every already-normalized encoding row.
    ///
    /// `dist(e, c) = |e|^2 - 2 e.c + |c|^2` over normalized entries. Ties go
    /// to the lowest index: a later entry only wins on a strictly smaller
    /// distance.
    pub fn nearest(&self, encodings: &[f32]) -> Vec<u32> {
        let codebook = self.normalized();
        let c_sq: Vec<f32> = codebook
            .chunks_exact(self.dim)
            .map(|c| c.iter().map(|v| v * v).sum())
            .collect();

        encodings
            .chunks_exact(self.dim)
            .map(|e| {
                let e_sq: f32 = e.iter().map(|v| v * v).sum();
                let mut best = 0usize;
                let mut best_dist = f32::INFINITY;
                for (k, c) in codebook.chunks_exact(self.dim).enumerate() {
                    let dot: f32 = e.iter().zip(c).map(|(a, b)| a * b).sum();
                    let dist = e_sq - 2.0 * dot + c_sq[k];
                    if dist < best_dist {
                        best = k;
                        best_dist = dist;
                    }
                }
                best as u32
            })
            .collect()
    }

    /// Gather entries for `indices`, producing `indices.len() x dim` rows.
    pub fn lookup(&self, indices: &[u32]) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(indices.len() * self.dim);
        for &code in indices {
            if code as usize >= self.size {
                return Err(Error::CodeOutOfRange {
                    code,
                    codebook_size: self.size,
                });
            }
            out.extend_from_slice(self.entry(code as usize));
        }
        Ok(out)
    }

    /// Overwrite entry `index` with `value`.
    pub(crate) fn set_entry(&mut self, index: usize, value: &[f32]) {
        let dim = self.dim;
        self.entries[index * dim..(index + 1) * dim].copy_from_slice(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn axes() -> Codebook {
        Codebook::new(
            vec![1.0, 0.0, 0.0, 1.0, -1.0, 0.0, 0.0, -1.0],
            4,
            2,
        )
        .unwrap()
    }

    fn normalized(mut rows: Vec<f32>, dim: usize) -> Vec<f32> {
        l2_normalize_rows(&mut rows, dim);
        rows
    }

    #[test]
    fn test_nearest_picks_closest_direction() {
        let cb = axes();
        let enc = normalized(vec![0.9, 0.1, 0.1, 0.8, -3.0, 0.5, 0.2, -7.0], 2);
        assert_eq!(cb.nearest(&enc), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_nearest_is_scale_invariant() {
        // Entry 1 is far away in Euclidean terms but aligned in direction.
        let cb = Codebook::new(vec![0.5, 0.5, 10.0, 0.1], 2, 2).unwrap();
        let enc = normalized(vec![1.0, 0.01], 2);
        assert_eq!(cb.nearest(&enc), vec![1]);
    }

    #[test]
    fn test_ties_resolve_to_lowest_index() {
        // Entries 1 and 3 are identical; the query is equidistant to 0 and 1.
        let cb = Codebook::new(vec![1.0, 0.0, 0.0, 1.0, -1.0, 0.0, 0.0, 1.0], 4, 2).unwrap();
        let enc = normalized(vec![0.0, 1.0], 2);
        assert_eq!(cb.nearest(&enc), vec![1]);

        let enc = normalized(vec![1.0, 1.0], 2);
        assert_eq!(cb.nearest(&enc), vec![0]);
    }

    #[test]
    fn test_zero_vectors_do_not_produce_nan() {
        let mut rows = vec![0.0; 4];
        assert_eq!(l2_normalize_rows(&mut rows, 2), 2);
        assert!(rows.iter().all(|v| v.is_finite()));

        // Zero entry in the codebook and a zero encoding.
        let cb = Codebook::new(vec![0.0, 0.0, 1.0, 0.0], 2, 2).unwrap();
        let idx = cb.nearest(&rows);
        assert_eq!(idx, vec![0, 0]);
        assert!(cb.normalized().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_lookup_and_range_check() {
        let cb = axes();
        assert_eq!(cb.lookup(&[2, 0]).unwrap(), vec![-1.0, 0.0, 1.0, 0.0]);
        assert!(matches!(
            cb.lookup(&[4]),
            Err(Error::CodeOutOfRange {
                code: 4,
                codebook_size: 4
            })
        ));
    }

    #[test]
    fn test_random_init_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let cb = Codebook::random(16, 3, &mut rng).unwrap();
        assert_eq!(cb.entries().len(), 48);
        assert!(cb.entries().iter().all(|v| v.is_finite()));
        assert!(Codebook::random(0, 3, &mut rng).is_err());
    }
}
