//! Running statistics for observation and reward normalization
//!
//! [`RunningMeanStd`] tracks mean and variance with the parallel-axis merge
//! (Chan et al.), so feeding the same values in any batch split gives the
//! same result as computing the population statistics in closed form.
//! [`RewardForwardFilter`] produces the discounted running reward sums whose
//! spread is used to scale intrinsic rewards.

use serde::{Deserialize, Serialize};

/// Running mean and variance of a fixed-size vector quantity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningMeanStd {
    mean: Vec<f64>,
    var: Vec<f64>,
    count: f64,
    epsilon: f64,
}

impl RunningMeanStd {
    /// Create a new accumulator
    ///
    /// # Arguments
    /// * `size` - Dimension of the tracked quantity (1 for scalars)
    /// * `epsilon` - Small constant added to the variance before `sqrt`
    pub fn new(size: usize, epsilon: f64) -> Self {
        Self { mean: vec![0.0; size], var: vec![1.0; size], count: 0.0, epsilon }
    }

    /// Update statistics with a batch of vectors
    ///
    /// # Arguments
    /// * `batch` - Batch of values [batch_size][size]
    pub fn update(&mut self, batch: &[Vec<f32>]) {
        if batch.is_empty() {
            return;
        }

        let batch_count = batch.len() as f64;
        let dim = self.mean.len();

        let mut batch_mean = vec![0.0; dim];
        for row in batch {
            debug_assert_eq!(row.len(), dim, "RunningMeanStd dimension mismatch");
            for (acc, &val) in batch_mean.iter_mut().zip(row) {
                *acc += val as f64;
            }
        }
        for val in &mut batch_mean {
            *val /= batch_count;
        }

        let mut batch_var = vec![0.0; dim];
        for row in batch {
            for ((acc, &val), mean) in batch_var.iter_mut().zip(row).zip(&batch_mean) {
                let diff = val as f64 - mean;
                *acc += diff * diff;
            }
        }
        for val in &mut batch_var {
            *val /= batch_count;
        }

        self.update_from_moments(&batch_mean, &batch_var, batch_count);
    }

    /// Update a scalar accumulator (`size == 1`) with a batch of values
    pub fn update_scalars(&mut self, values: &[f32]) {
        debug_assert_eq!(self.mean.len(), 1, "update_scalars needs a size-1 accumulator");
        if values.is_empty() {
            return;
        }
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        self.update_from_moments(&[mean], &[var], n);
    }

    /// Merge precomputed batch moments into the running statistics
    pub fn update_from_moments(&mut self, batch_mean: &[f64], batch_var: &[f64], batch_count: f64) {
        if batch_count <= 0.0 {
            return;
        }
        if self.count == 0.0 {
            self.mean.copy_from_slice(batch_mean);
            self.var.copy_from_slice(batch_var);
            self.count = batch_count;
            return;
        }

        let total_count = self.count + batch_count;
        for i in 0..self.mean.len() {
            let delta = batch_mean[i] - self.mean[i];
            let m_a = self.var[i] * self.count;
            let m_b = batch_var[i] * batch_count;
            let m2 = m_a + m_b + delta * delta * self.count * batch_count / total_count;

            self.mean[i] += delta * batch_count / total_count;
            self.var[i] = m2 / total_count;
        }
        self.count = total_count;
    }

    /// Mean of the per-dimension standard deviations
    pub fn pooled_std(&self) -> f64 {
        let std = self.std();
        std.iter().sum::<f64>() / std.len().max(1) as f64
    }

    /// Center each dimension, then divide by the [`pooled_std`](Self::pooled_std)
    ///
    /// Dimensions that never varied while the statistics were gathered don't
    /// blow up when they later change.
    pub fn normalize_pooled(&self, values: &[f32]) -> Vec<f32> {
        let std = self.pooled_std();
        values
            .iter()
            .zip(&self.mean)
            .map(|(&x, &mean)| ((x as f64 - mean) / std) as f32)
            .collect()
    }

    /// Divide a scalar by the running standard deviation without centering
    pub fn scale(&self, value: f32) -> f32 {
        (value as f64 / self.std()[0]) as f32
    }

    /// Get current mean
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Get current (population) variance
    pub fn var(&self) -> &[f64] {
        &self.var
    }

    /// Get current standard deviation, `sqrt(var + epsilon)`
    pub fn std(&self) -> Vec<f64> {
        self.var.iter().map(|v| (v + self.epsilon).sqrt()).collect()
    }

    /// Get number of samples seen
    pub fn count(&self) -> f64 {
        self.count
    }

    /// Dimension of the tracked quantity
    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// Discounted running sum of rewards, one lane per environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardForwardFilter {
    gamma: f64,
    rewems: Option<Vec<f64>>,
}

impl RewardForwardFilter {
    /// Create a filter with discount `gamma`
    pub fn new(gamma: f64) -> Self {
        Self { gamma, rewems: None }
    }

    /// Fold in one timestep of rewards (one per environment) and return the
    /// updated running sums
    pub fn update(&mut self, rewards: &[f32]) -> Vec<f32> {
        if let Some(rewems) = self.rewems.as_mut() {
            for (acc, &r) in rewems.iter_mut().zip(rewards) {
                *acc = *acc * self.gamma + r as f64;
            }
        } else {
            self.rewems = Some(rewards.iter().map(|&r| r as f64).collect());
        }
        self.rewems.iter().flatten().map(|&v| v as f32).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_form(values: &[f32]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        (mean, var)
    }

    #[test]
    fn test_normalize_basic() {
        let mut normalizer = RunningMeanStd::new(2, 1e-8);

        let data = vec![vec![1.0, 2.0], vec![2.0, 4.0], vec![3.0, 6.0]];
        normalizer.update(&data);

        assert!((normalizer.mean()[0] - 2.0).abs() < 1e-9);
        assert!((normalizer.mean()[1] - 4.0).abs() < 1e-9);

        let normalized = normalizer.normalize_pooled(&[2.0, 4.0]);
        assert!(normalized[0].abs() < 1e-6);
        assert!(normalized[1].abs() < 1e-6);
    }

    #[test]
    fn test_matches_closed_form() {
        let values: Vec<f32> = (0..97).map(|i| ((i * 37) % 23) as f32 * 0.5 - 3.0).collect();
        let (mean, var) = closed_form(&values);

        let mut stats = RunningMeanStd::new(1, 1e-8);
        for chunk in values.chunks(10) {
            stats.update_scalars(chunk);
        }

        assert_eq!(stats.count(), 97.0);
        assert!((stats.mean()[0] - mean).abs() < 1e-9);
        assert!((stats.var()[0] - var).abs() < 1e-9);
    }

    #[test]
    fn test_order_invariance() {
        let values: Vec<f32> = (0..60).map(|i| (i as f32).sin() * 4.0 + 1.0).collect();
        let mut reversed = values.clone();
        reversed.reverse();

        let mut forward = RunningMeanStd::new(1, 1e-8);
        for v in &values {
            forward.update_scalars(&[*v]);
        }

        let mut backward = RunningMeanStd::new(1, 1e-8);
        for chunk in reversed.chunks(7) {
            backward.update_scalars(chunk);
        }

        assert!((forward.mean()[0] - backward.mean()[0]).abs() < 1e-9);
        assert!((forward.var()[0] - backward.var()[0]).abs() < 1e-9);
    }

    #[test]
    fn test_vector_update_matches_per_dimension() {
        let batch: Vec<Vec<f32>> = (0..20).map(|i| vec![i as f32, (i * i) as f32]).collect();
        let mut stats = RunningMeanStd::new(2, 1e-8);
        stats.update(&batch[..5]);
        stats.update(&batch[5..]);

        let first: Vec<f32> = batch.iter().map(|r| r[0]).collect();
        let second: Vec<f32> = batch.iter().map(|r| r[1]).collect();
        let (m0, v0) = closed_form(&first);
        let (m1, v1) = closed_form(&second);

        assert!((stats.mean()[0] - m0).abs() < 1e-9);
        assert!((stats.var()[0] - v0).abs() < 1e-9);
        assert!((stats.mean()[1] - m1).abs() < 1e-6);
        assert!((stats.var()[1] - v1).abs() < 1e-6);
    }

    #[test]
    fn test_scale_keeps_sign() {
        let mut stats = RunningMeanStd::new(1, 0.0);
        stats.update_scalars(&[2.0, 6.0]);
        // var = 4, std = 2, mean ignored
        assert_eq!(stats.scale(4.0), 2.0);
        assert_eq!(stats.scale(-4.0), -2.0);
        assert_eq!(stats.scale(0.0), 0.0);
    }

    #[test]
    fn test_pooled_normalization() {
        let mut stats = RunningMeanStd::new(2, 0.0);
        // dim 0 has std 2, dim 1 never varies
        stats.update(&[vec![0.0, 5.0], vec![4.0, 5.0]]);
        assert_eq!(stats.pooled_std(), 1.0);
        assert_eq!(stats.normalize_pooled(&[4.0, 7.0]), vec![2.0, 2.0]);
    }

    #[test]
    fn test_forward_filter_discounts() {
        let mut rff = RewardForwardFilter::new(0.5);
        assert_eq!(rff.update(&[1.0, 2.0]), vec![1.0, 2.0]);
        assert_eq!(rff.update(&[1.0, 0.0]), vec![1.5, 1.0]);
        assert_eq!(rff.update(&[0.0, 0.0]), vec![0.75, 0.5]);
    }
}
