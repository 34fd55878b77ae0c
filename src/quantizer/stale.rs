//! Per-entry usage counters for dead-code detection.

use rand::Rng;
use rand::seq::SliceRandom;

use super::codebook::Codebook;
use crate::{Error, Result};

/// Counts, for every codebook entry, how many consecutive training batches
/// went by without the entry being selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleTracker {
    counters: Vec<u32>,
    tolerance: u32,
}

impl StaleTracker {
    pub fn new(size: usize, tolerance: u32) -> Self {
        Self {
            counters: vec![0; size],
            tolerance,
        }
    }

    /// Restore counters, e.g. from a checkpoint.
    pub fn from_counters(counters: Vec<u32>, tolerance: u32) -> Self {
        Self {
            counters,
            tolerance,
        }
    }

    pub fn counters(&self) -> &[u32] {
        &self.counters
    }

    pub fn tolerance(&self) -> u32 {
        self.tolerance
    }

    /// Update counters from one batch of selected indices: entries picked at
    /// least once reset to 0, all others advance by exactly 1.
    pub fn record_usage(&mut self, indices: &[u32]) {
        let mut used = vec![false; self.counters.len()];
        for &i in indices {
            if let Some(slot) = used.get_mut(i as usize) {
                *slot = true;
            }
        }
        for (counter, used) in self.counters.iter_mut().zip(used) {
            *counter = if used { 0 } else { *counter + 1 };
        }
    }

    /// Entries whose counter has reached the tolerance.
    pub fn stale_entries(&self) -> Vec<usize> {
        self.counters
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == self.tolerance)
            .map(|(i, _)| i)
            .collect()
    }

    /// Replace every stale entry of `codebook` with a row sampled from
    /// `encodings` (`n x dim`, the current batch), then reset its counter.
    ///
    /// Rows come from a random permutation of the batch, tiled when the
    /// batch has fewer rows than the codebook; entry `k` takes row `k` of
    /// that sequence. The stale set and the replacement rows are fixed
    /// before any entry is written. Returns the number of replaced entries.
    pub fn revive<R: Rng>(
        &mut self,
        codebook: &mut Codebook,
        encodings: &[f32],
        rng: &mut R,
    ) -> Result<usize> {
        if codebook.size() != self.counters.len() {
            return Err(Error::Shape(format!(
                "tracker has {} counters for a codebook of {} entries",
                self.counters.len(),
                codebook.size()
            )));
        }
        let stale = self.stale_entries();
        if stale.is_empty() {
            return Ok(0);
        }

        let dim = codebook.dim();
        let n_rows = encodings.len() / dim;
        if n_rows == 0 {
            tracing::warn!(
                "{} stale codes but the batch has no encodings; skipping revival",
                stale.len()
            );
            return Ok(0);
        }

        let mut perm: Vec<usize> = (0..n_rows).collect();
        perm.shuffle(rng);
        let replacements: Vec<(usize, &[f32])> = stale
            .iter()
            .map(|&k| {
                let row = perm[k % n_rows];
                (k, &encodings[row * dim..(row + 1) * dim])
            })
            .collect();

        for (k, row) in &replacements {
            codebook.set_entry(*k, row);
            self.counters[*k] = 0;
        }
        Ok(replacements.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_record_usage_increments_unused_and_resets_used() {
        let mut tracker = StaleTracker::from_counters(vec![5, 5, 5, 5], 100);
        tracker.record_usage(&[0, 1, 1, 3]);
        assert_eq!(tracker.counters(), &[0, 0, 6, 0]);
        tracker.record_usage(&[2]);
        assert_eq!(tracker.counters(), &[1, 1, 0, 1]);
    }

    #[test]
    fn test_empty_batch_ages_every_entry() {
        let mut tracker = StaleTracker::new(3, 10);
        tracker.record_usage(&[]);
        assert_eq!(tracker.counters(), &[1, 1, 1]);
    }

    #[test]
    fn test_revive_replaces_only_stale_entries() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut codebook = Codebook::new(vec![1.0, 0.0, 0.0, 1.0, -1.0, 0.0], 3, 2).unwrap();
        let mut tracker = StaleTracker::from_counters(vec![0, 3, 2], 3);
        let encodings = vec![0.6, 0.8, 0.8, 0.6];

        let replaced = tracker.revive(&mut codebook, &encodings, &mut rng).unwrap();
        assert_eq!(replaced, 1);
        assert_eq!(tracker.counters(), &[0, 0, 2]);
        assert_eq!(codebook.entry(0), &[1.0, 0.0]);
        assert_eq!(codebook.entry(2), &[-1.0, 0.0]);
        let e1 = codebook.entry(1);
        assert!(e1 == [0.6, 0.8] || e1 == [0.8, 0.6]);
    }

    #[test]
    fn test_revive_tiles_small_batches() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        // 6 entries, all stale, but the batch only has one row.
        let mut codebook = Codebook::new(vec![0.0; 12], 6, 2).unwrap();
        let mut tracker = StaleTracker::from_counters(vec![4; 6], 4);
        let replaced = tracker
            .revive(&mut codebook, &[0.0, 1.0], &mut rng)
            .unwrap();
        assert_eq!(replaced, 6);
        for k in 0..6 {
            assert_eq!(codebook.entry(k), &[0.0, 1.0]);
        }
        assert!(tracker.counters().iter().all(|&c| c == 0));
    }

    #[test]
    fn test_revive_without_encodings_is_a_noop() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut codebook = Codebook::new(vec![1.0, 2.0], 1, 2).unwrap();
        let mut tracker = StaleTracker::from_counters(vec![2], 2);
        assert_eq!(tracker.revive(&mut codebook, &[], &mut rng).unwrap(), 0);
        assert_eq!(codebook.entry(0), &[1.0, 2.0]);
        assert_eq!(tracker.counters(), &[2]);
    }
}
