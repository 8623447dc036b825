//! Fixed random features

use tch::{Tensor, nn, nn::Module};

use super::{
    AuxBatch, FeatureConfig, FeatureExtractor, FeatureLearning, layernorm, mlp_encoder, zero_loss,
};

/// Randomly initialized encoder that is never trained
///
/// Encoding runs without gradient tracking, so no loss ever reaches these
/// parameters and the optimizer leaves them untouched.
#[derive(Debug)]
pub struct RandomFeatures {
    encoder: nn::Sequential,
    feat_dim: i64,
    layernorm: bool,
}

impl RandomFeatures {
    pub fn new(path: &nn::Path, obs_dim: i64, config: &FeatureConfig) -> Self {
        let encoder = mlp_encoder(&(path / "encoder"), obs_dim, config.hidden_dim, config.feat_dim);
        Self { encoder, feat_dim: config.feat_dim, layernorm: config.layernorm }
    }
}

impl FeatureExtractor for RandomFeatures {
    fn kind(&self) -> FeatureLearning {
        FeatureLearning::None
    }

    fn feat_dim(&self) -> i64 {
        self.feat_dim
    }

    fn encode(&self, observations: &Tensor) -> Tensor {
        tch::no_grad(|| {
            let features = self.encoder.forward(observations);
            if self.layernorm { layernorm(&features) } else { features }
        })
    }

    fn auxiliary_loss(&self, batch: &AuxBatch<'_>) -> Tensor {
        zero_loss(batch.observations.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_features_carry_no_gradient() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = FeatureConfig { feat_dim: 4, hidden_dim: 16, ..Default::default() };
        let extractor = RandomFeatures::new(&(vs.root() / "features"), 6, &config);

        let obs = Tensor::randn([3, 6], (Kind::Float, Device::Cpu));
        let features = extractor.encode(&obs);
        assert!(!features.requires_grad());

        // Same input, same output
        let again = extractor.encode(&obs);
        let diff = f64::try_from((&features - &again).abs().max()).unwrap();
        assert_eq!(diff, 0.0);
    }
}
