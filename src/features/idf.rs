//! Inverse-dynamics features
//!
//! The encoder is trained to make the action recoverable from
//! `(phi(s_t), phi(s_{t+1}))`, which pushes it toward features the agent can
//! actually influence and away from uncontrollable noise.

use tch::{
    Kind, Tensor,
    nn::{self, Module},
};

use super::{AuxBatch, FeatureConfig, FeatureExtractor, FeatureLearning, layernorm, mlp_encoder};

#[derive(Debug)]
pub struct InverseDynamics {
    encoder: nn::Sequential,
    head: nn::Sequential,
    feat_dim: i64,
    layernorm: bool,
}

impl InverseDynamics {
    pub fn new(path: &nn::Path, obs_dim: i64, action_dim: i64, config: &FeatureConfig) -> Self {
        let encoder = mlp_encoder(&(path / "encoder"), obs_dim, config.hidden_dim, config.feat_dim);
        let head = nn::seq()
            .add(nn::linear(
                path / "inverse" / "fc1",
                2 * config.feat_dim,
                config.hidden_dim,
                Default::default(),
            ))
            .add_fn(|x| x.relu())
            .add(nn::linear(
                path / "inverse" / "out",
                config.hidden_dim,
                action_dim,
                Default::default(),
            ));

        Self { encoder, head, feat_dim: config.feat_dim, layernorm: config.layernorm }
    }

    /// Action logits for a batch of transitions [B, A]
    pub fn action_logits(&self, observations: &Tensor, next_observations: &Tensor) -> Tensor {
        let features = self.encode(observations);
        let next_features = self.encode(next_observations);
        self.head.forward(&Tensor::cat(&[&features, &next_features], 1))
    }
}

impl FeatureExtractor for InverseDynamics {
    fn kind(&self) -> FeatureLearning {
        FeatureLearning::Idf
    }

    fn feat_dim(&self) -> i64 {
        self.feat_dim
    }

    fn encode(&self, observations: &Tensor) -> Tensor {
        let features = self.encoder.forward(observations);
        if self.layernorm { layernorm(&features) } else { features }
    }

    fn auxiliary_loss(&self, batch: &AuxBatch<'_>) -> Tensor {
        self.action_logits(batch.observations, batch.next_observations)
            .to_kind(Kind::Float)
            .cross_entropy_for_logits(batch.actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, nn::OptimizerConfig};

    #[test]
    fn test_learns_to_recover_action() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = FeatureConfig { feat_dim: 8, hidden_dim: 32, ..Default::default() };
        let idf = InverseDynamics::new(&(vs.root() / "features"), 4, 2, &config);
        let mut opt = nn::Adam::default().build(&vs, 1e-2).unwrap();

        // Action 0 moves the first coordinate up, action 1 moves it down
        let obs = Tensor::randn([64, 4], (Kind::Float, Device::Cpu));
        let actions = Tensor::randint(2, [64], (Kind::Int64, Device::Cpu));
        let sign = actions.to_kind(Kind::Float) * -2.0 + 1.0;
        let rest = Tensor::zeros([64, 3], (Kind::Float, Device::Cpu));
        let next = &obs + Tensor::cat(&[sign.unsqueeze(1), rest], 1);

        let batch = AuxBatch { observations: &obs, next_observations: &next, actions: &actions };
        let initial = f64::try_from(idf.auxiliary_loss(&batch)).unwrap();
        for _ in 0..200 {
            let loss = idf.auxiliary_loss(&batch);
            opt.backward_step(&loss);
        }
        let trained = f64::try_from(idf.auxiliary_loss(&batch)).unwrap();

        assert!(trained < initial * 0.5, "loss {initial} -> {trained}");
    }
}
