//! Multi-Layer Perceptron (MLP) policy for discrete actions
//!
//! This module provides a simple feedforward actor-critic network using
//! tch-rs. The policy outputs both action logits and value estimates,
//! which is standard for actor-critic algorithms like PPO.
//!
//! # Architecture
//!
//! ```text
//! Input (normalized observations or extractor features)
//!         |
//!   [Dense(hidden)]
//!         |
//!     activation
//!         |
//!   [Dense(hidden)]
//!         |
//!     activation
//!      /     \
//!  Policy   Value
//!  Head     Head
//!     |        |
//! [Dense(n)]  [Dense(1)]
//!     |        |
//!  Logits    Value
//! ```
//!
//! Parameters live under whatever [`nn::Path`] the caller hands in, so the
//! policy shares one variable store with the feature extractor and the
//! dynamics ensemble.

use serde::{Deserialize, Serialize};
use tch::{
    Kind, Tensor,
    nn::{self, Init, Module},
};

/// Configuration for MLP policy architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    pub num_layers: usize,
    pub hidden_dim: i64,
    pub use_orthogonal_init: bool,
    pub activation: Activation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    #[serde(rename = "relu")]
    ReLU,
    #[serde(rename = "leaky_relu")]
    LeakyReLU,
    #[serde(rename = "tanh")]
    Tanh,
}

impl Activation {
    /// Apply the activation
    pub fn apply(self, x: &Tensor) -> Tensor {
        match self {
            Activation::ReLU => x.relu(),
            Activation::LeakyReLU => x.leaky_relu(),
            Activation::Tanh => x.tanh(),
        }
    }
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            hidden_dim: 512,
            use_orthogonal_init: true,
            activation: Activation::ReLU,
        }
    }
}

/// Multi-layer perceptron actor-critic for discrete actions
///
/// Implements an actor-critic architecture with:
/// - Shared trunk (`num_layers` dense layers)
/// - Orthogonal weight initialization
/// - Separate policy head (outputs action logits)
/// - Separate value head (outputs state value estimate)
#[derive(Debug)]
pub struct MlpPolicy {
    shared: nn::Sequential,
    policy_head: nn::Linear,
    value_head: nn::Linear,
    action_dim: i64,
}

impl MlpPolicy {
    /// Create a new MLP policy
    ///
    /// # Arguments
    ///
    /// * `path` - Variable-store scope for the policy parameters
    /// * `input_dim` - Input dimensionality
    /// * `action_dim` - Number of discrete actions
    /// * `config` - Architecture configuration
    pub fn new(path: &nn::Path, input_dim: i64, action_dim: i64, config: &MlpConfig) -> Self {
        let hidden_init = if config.use_orthogonal_init {
            Init::Orthogonal { gain: 2.0_f64.sqrt() }
        } else {
            Init::Randn { mean: 0.0, stdev: 0.01 }
        };
        let linear_config = nn::LinearConfig { ws_init: hidden_init, ..Default::default() };

        let activation = config.activation;
        let mut shared = nn::seq();
        let mut in_dim = input_dim;
        for layer in 0..config.num_layers.max(1) {
            shared = shared
                .add(nn::linear(
                    path / "shared" / format!("fc{}", layer + 1),
                    in_dim,
                    config.hidden_dim,
                    linear_config,
                ))
                .add_fn(move |x| activation.apply(x));
            in_dim = config.hidden_dim;
        }

        // Output heads start near uniform / zero
        let output_init = if config.use_orthogonal_init {
            Init::Orthogonal { gain: 0.01 }
        } else {
            Init::Randn { mean: 0.0, stdev: 0.01 }
        };
        let output_config = nn::LinearConfig { ws_init: output_init, ..Default::default() };

        let policy_head = nn::linear(path / "pd", config.hidden_dim, action_dim, output_config);
        let value_head = nn::linear(path / "vf", config.hidden_dim, 1, output_config);

        Self { shared, policy_head, value_head, action_dim }
    }

    /// Forward pass: compute action logits [B, A] and values [B]
    pub fn forward(&self, input: &Tensor) -> (Tensor, Tensor) {
        let hidden = self.shared.forward(input);
        let logits = self.policy_head.forward(&hidden);
        let values = self.value_head.forward(&hidden).squeeze_dim(-1);
        (logits, values)
    }

    /// Sample actions and return `(actions, log_probs, values)`
    pub fn act(&self, input: &Tensor) -> (Tensor, Tensor, Tensor) {
        let (logits, values) = self.forward(input);

        let log_probs_all = logits.log_softmax(-1, Kind::Float);
        let actions = log_probs_all.exp().multinomial(1, true).squeeze_dim(-1);

        let log_probs = log_probs_all.gather(-1, &actions.unsqueeze(-1), false).squeeze_dim(-1);
        (actions, log_probs, values)
    }

    /// Evaluate actions: `(log_probs, entropy, values)`, all [B]
    ///
    /// Entropy is per sample; callers reduce it.
    pub fn evaluate_actions(&self, input: &Tensor, actions: &Tensor) -> (Tensor, Tensor, Tensor) {
        let (logits, values) = self.forward(input);

        let log_probs = logits.log_softmax(-1, Kind::Float);
        let probs = log_probs.exp();

        let action_log_probs = log_probs.gather(-1, &actions.unsqueeze(-1), false).squeeze_dim(-1);

        // H = -Σ p(x) * log(p(x))
        let entropy = -(probs * log_probs).sum_dim_intlist(-1, false, Kind::Float);
        (action_log_probs, entropy, values)
    }

    /// Number of discrete actions
    pub fn action_dim(&self) -> i64 {
        self.action_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn policy(vs: &nn::VarStore) -> MlpPolicy {
        let config = MlpConfig { hidden_dim: 64, ..Default::default() };
        MlpPolicy::new(&(vs.root() / "policy"), 4, 3, &config)
    }

    #[test]
    fn test_config_partial_json() {
        let config: MlpConfig = serde_json::from_str(r#"{"hidden_dim": 64}"#).unwrap();
        assert_eq!(config.hidden_dim, 64);
        assert_eq!(config.num_layers, MlpConfig::default().num_layers);
        assert_eq!(config.activation, Activation::ReLU);
    }

    #[test]
    fn test_forward_pass() {
        let vs = nn::VarStore::new(Device::Cpu);
        let policy = policy(&vs);
        let obs = Tensor::randn([8, 4], (Kind::Float, Device::Cpu));

        let (logits, values) = policy.forward(&obs);

        assert_eq!(logits.size(), vec![8, 3]);
        assert_eq!(values.size(), vec![8]);
    }

    #[test]
    fn test_act() {
        let vs = nn::VarStore::new(Device::Cpu);
        let policy = policy(&vs);
        let obs = Tensor::randn([16, 4], (Kind::Float, Device::Cpu));

        let (actions, log_probs, values) = policy.act(&obs);

        assert_eq!(actions.size(), vec![16]);
        assert_eq!(log_probs.size(), vec![16]);
        assert_eq!(values.size(), vec![16]);

        let actions_vec: Vec<i64> = Vec::try_from(&actions).unwrap();
        assert!(actions_vec.iter().all(|&a| (0..3).contains(&a)));
        let lp: Vec<f32> = Vec::try_from(&log_probs).unwrap();
        assert!(lp.iter().all(|&l| l <= 0.0));
    }

    #[test]
    fn test_evaluate_actions_matches_act() {
        let vs = nn::VarStore::new(Device::Cpu);
        let policy = policy(&vs);
        let obs = Tensor::randn([8, 4], (Kind::Float, Device::Cpu));

        let (actions, log_probs, _) = policy.act(&obs);
        let (eval_log_probs, entropy, values) = policy.evaluate_actions(&obs, &actions);

        assert_eq!(entropy.size(), vec![8]);
        assert_eq!(values.size(), vec![8]);

        let diff = f64::try_from((&log_probs - &eval_log_probs).abs().max()).unwrap();
        assert!(diff < 1e-5);

        // Near-uniform init: entropy close to ln(3)
        let mean_entropy = f64::try_from(entropy.mean(Kind::Float)).unwrap();
        assert!(mean_entropy > 0.9 && mean_entropy <= 3f64.ln() + 1e-5);
    }

    #[test]
    fn test_parameters_scoped_under_path() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _policy = policy(&vs);

        let names: Vec<String> = vs.variables().into_keys().collect();
        assert!(names.iter().all(|n| n.starts_with("policy.")));
        assert!(names.contains(&"policy.shared.fc1.weight".to_string()));
        assert!(names.contains(&"policy.pd.weight".to_string()));
        assert!(names.contains(&"policy.vf.bias".to_string()));
    }

    #[test]
    fn test_batch_consistency() {
        let vs = nn::VarStore::new(Device::Cpu);
        let policy = policy(&vs);

        let obs_single = Tensor::randn([1, 4], (Kind::Float, Device::Cpu));
        let (logits_single, _) = policy.forward(&obs_single);

        let obs_batch = obs_single.repeat([8, 1]);
        let (logits_batch, _) = policy.forward(&obs_batch);

        for i in 0..8 {
            let logits_i = logits_batch.get(i);
            let diff = (&logits_single.squeeze() - &logits_i).abs().mean(Kind::Float);
            let diff_val: f64 = diff.try_into().unwrap();
            assert!(diff_val < 1e-5);
        }
    }
}
