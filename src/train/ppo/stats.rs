//! Training statistics for PPO
//!
//! This module defines structures for tracking and aggregating
//! training metrics during PPO training.

use std::collections::BTreeMap;
use std::ops::AddAssign;

/// Training statistics for a PPO update
///
/// Tracks the loss terms and diagnostics of one gradient step; summed over
/// every minibatch of an update and then averaged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingStats {
    /// Policy loss
    pub policy_loss: f64,

    /// Value function loss
    pub value_loss: f64,

    /// Mean policy entropy
    pub entropy: f64,

    /// Feature-extractor auxiliary loss
    pub aux_loss: f64,

    /// Summed dynamics-ensemble loss
    pub dyn_loss: f64,

    /// Total loss that was back-propagated
    pub total_loss: f64,

    /// Fraction of clipped policy updates
    pub clip_fraction: f64,

    /// Approximate KL divergence between old and new policies
    pub approx_kl: f64,

    /// Explained variance of value function predictions
    pub explained_var: f64,

    /// Mean per-dimension variance of the encoded features
    pub feat_var: f64,

    /// Global gradient norm before clipping
    pub grad_norm: f64,

    /// Number of gradient updates performed
    pub num_updates: usize,
}

impl TrainingStats {
    /// Create zero-initialized statistics
    pub fn zeros() -> Self {
        Self::default()
    }

    /// Add another statistics instance to this one
    pub fn add(&mut self, other: &TrainingStats) {
        self.policy_loss += other.policy_loss;
        self.value_loss += other.value_loss;
        self.entropy += other.entropy;
        self.aux_loss += other.aux_loss;
        self.dyn_loss += other.dyn_loss;
        self.total_loss += other.total_loss;
        self.clip_fraction += other.clip_fraction;
        self.approx_kl += other.approx_kl;
        self.explained_var += other.explained_var;
        self.feat_var += other.feat_var;
        self.grad_norm += other.grad_norm;
        self.num_updates += other.num_updates;
    }

    /// Compute average statistics across multiple updates
    pub fn average(&self) -> Self {
        let scale = self.num_updates as f64;
        if scale == 0.0 {
            return Self::zeros();
        }

        Self {
            policy_loss: self.policy_loss / scale,
            value_loss: self.value_loss / scale,
            entropy: self.entropy / scale,
            aux_loss: self.aux_loss / scale,
            dyn_loss: self.dyn_loss / scale,
            total_loss: self.total_loss / scale,
            clip_fraction: self.clip_fraction / scale,
            approx_kl: self.approx_kl / scale,
            explained_var: self.explained_var / scale,
            feat_var: self.feat_var / scale,
            grad_norm: self.grad_norm / scale,
            num_updates: 1,
        }
    }

    /// Flat metric map for a [`MetricsSink`](crate::train::metrics::MetricsSink)
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        [
            ("opt/policy_loss", self.policy_loss),
            ("opt/value_loss", self.value_loss),
            ("opt/entropy", self.entropy),
            ("opt/aux_loss", self.aux_loss),
            ("opt/dyn_loss", self.dyn_loss),
            ("opt/total_loss", self.total_loss),
            ("opt/clipfrac", self.clip_fraction),
            ("opt/approxkl", self.approx_kl),
            ("opt/explained_var", self.explained_var),
            ("opt/feat_var", self.feat_var),
            ("opt/grad_norm", self.grad_norm),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

impl AddAssign<&TrainingStats> for TrainingStats {
    fn add_assign(&mut self, other: &TrainingStats) {
        self.add(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_and_average() {
        let mut total = TrainingStats::zeros();
        let batch = |policy_loss, dyn_loss| TrainingStats {
            policy_loss,
            dyn_loss,
            num_updates: 1,
            ..Default::default()
        };
        total += &batch(1.0, 4.0);
        total += &batch(3.0, 2.0);

        let avg = total.average();
        assert_eq!(avg.policy_loss, 2.0);
        assert_eq!(avg.dyn_loss, 3.0);
        assert_eq!(avg.num_updates, 1);
    }

    #[test]
    fn test_average_of_nothing_is_zero() {
        assert_eq!(TrainingStats::zeros().average(), TrainingStats::zeros());
    }

    #[test]
    fn test_metric_names() {
        let metrics = TrainingStats { approx_kl: 0.5, ..Default::default() }.to_metrics();
        assert_eq!(metrics["opt/approxkl"], 0.5);
        assert!(metrics.contains_key("opt/feat_var"));
        assert!(!metrics.contains_key("num_updates"));
    }
}
