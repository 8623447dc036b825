//! Observation-as-feature passthrough

use tch::Tensor;

use super::{AuxBatch, FeatureExtractor, FeatureLearning, layernorm, zero_loss};

/// Uses the normalized observation itself as the feature vector
#[derive(Debug, Clone)]
pub struct JustPixels {
    obs_dim: i64,
    layernorm: bool,
}

impl JustPixels {
    pub fn new(obs_dim: i64, layernorm: bool) -> Self {
        Self { obs_dim, layernorm }
    }
}

impl FeatureExtractor for JustPixels {
    fn kind(&self) -> FeatureLearning {
        FeatureLearning::Pixels
    }

    fn feat_dim(&self) -> i64 {
        self.obs_dim
    }

    fn encode(&self, observations: &Tensor) -> Tensor {
        if self.layernorm { layernorm(observations) } else { observations.shallow_clone() }
    }

    fn auxiliary_loss(&self, batch: &AuxBatch<'_>) -> Tensor {
        zero_loss(batch.observations.device())
    }
}
