//! PopArt value-target normalization.
//!
//! Keeps debiased running estimates of the mean and mean-square of the
//! value-regression target. The estimator denormalizes stored value
//! predictions before bootstrapping; the trainers normalize return
//! targets before computing the value loss.

/// Adaptive value-target normalizer with exponential running statistics.
///
/// `update` folds a batch of raw targets into the running statistics;
/// `normalize`/`denormalize` map between raw and normalized space. Both
/// directions are exact inverses up to floating-point error once at
/// least one update has been applied.
#[derive(Debug, Clone)]
pub struct PopArt {
    beta: f64,
    epsilon: f64,
    running_mean: f64,
    running_mean_sq: f64,
    debiasing_term: f64,
}

impl PopArt {
    /// Creates a normalizer with decay `beta` (close to 1.0).
    pub fn new(beta: f64) -> Self {
        Self {
            beta,
            epsilon: 1e-5,
            running_mean: 0.0,
            running_mean_sq: 0.0,
            debiasing_term: 0.0,
        }
    }

    /// Debiased mean and standard deviation of everything seen so far.
    fn stats(&self) -> (f64, f64) {
        let debias = self.debiasing_term.max(self.epsilon);
        let mean = self.running_mean / debias;
        let mean_sq = self.running_mean_sq / debias;
        let var = (mean_sq - mean * mean).max(1e-2);
        (mean, var.sqrt())
    }

    /// Folds a batch of raw targets into the running statistics.
    pub fn update(&mut self, batch: &[f32]) {
        if batch.is_empty() {
            return;
        }
        let n = batch.len() as f64;
        let batch_mean = batch.iter().map(|&x| x as f64).sum::<f64>() / n;
        let batch_mean_sq = batch.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>() / n;

        self.running_mean = self.beta * self.running_mean + (1.0 - self.beta) * batch_mean;
        self.running_mean_sq = self.beta * self.running_mean_sq + (1.0 - self.beta) * batch_mean_sq;
        self.debiasing_term = self.beta * self.debiasing_term + (1.0 - self.beta);
    }

    /// Maps a raw target into normalized space.
    pub fn normalize(&self, x: f32) -> f32 {
        let (mean, std) = self.stats();
        ((x as f64 - mean) / std) as f32
    }

    /// Maps a normalized value back into raw space.
    pub fn denormalize(&self, x: f32) -> f32 {
        let (mean, std) = self.stats();
        (x as f64 * std + mean) as f32
    }

    /// Normalizes a slice in place.
    pub fn normalize_slice(&self, xs: &mut [f32]) {
        let (mean, std) = self.stats();
        for x in xs {
            *x = ((*x as f64 - mean) / std) as f32;
        }
    }
}

impl Default for PopArt {
    fn default() -> Self {
        Self::new(0.99999)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_after_update() {
        let mut norm = PopArt::new(0.9);
        norm.update(&[1.0, 2.0, 3.0, 4.0]);
        for &x in &[0.0f32, 2.5, -7.0, 100.0] {
            let back = norm.denormalize(norm.normalize(x));
            assert!((back - x).abs() < 1e-3, "round trip drifted: {x} -> {back}");
        }
    }

    #[test]
    fn statistics_track_the_batch_mean() {
        let mut norm = PopArt::new(0.5);
        for _ in 0..64 {
            norm.update(&[10.0; 8]);
        }
        // A constant stream of 10s normalizes close to zero.
        assert!(norm.normalize(10.0).abs() < 0.1);
    }

    #[test]
    fn empty_update_is_a_no_op() {
        let mut norm = PopArt::default();
        norm.update(&[]);
        assert_eq!(norm.normalize(1.0), norm.normalize(1.0));
    }

    #[test]
    fn normalize_slice_matches_scalar_form() {
        let mut norm = PopArt::new(0.9);
        norm.update(&[5.0, -5.0, 2.0]);
        let mut xs = [1.0f32, 2.0, 3.0];
        let expected: Vec<f32> = xs.iter().map(|&x| norm.normalize(x)).collect();
        norm.normalize_slice(&mut xs);
        assert_eq!(xs.to_vec(), expected);
    }
}
