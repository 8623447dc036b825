//! Training configuration and hyperparameters
//!
//! This module defines the configuration parameters for PPO training with a
//! disagreement bonus and provides validation and builder pattern methods.
//! [`TrainConfig`] bundles every section and round-trips through JSON.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::dynamics::DynamicsConfig;
use crate::features::FeatureConfig;
use crate::policy::MlpConfig;

/// PPO configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PPOConfig {
    /// Learning rate for every network (single Adam optimizer)
    pub learning_rate: f64,

    /// Number of passes over each segment
    pub n_epochs: usize,

    /// Number of minibatches each pass is split into
    pub n_minibatches: usize,

    /// Discount factor (gamma)
    pub gamma: f64,

    /// GAE lambda parameter
    pub gae_lambda: f64,

    /// PPO clipping parameter (epsilon)
    pub clip_range: f64,

    /// Value function clipping parameter
    pub clip_range_vf: Option<f64>,

    /// Coefficient for value function loss
    pub vf_coef: f64,

    /// Coefficient for entropy bonus
    pub ent_coef: f64,

    /// Maximum gradient norm for clipping
    pub max_grad_norm: Option<f64>,

    /// Normalize advantages over the full segment
    pub norm_adv: bool,

    /// Let episode ends cut the value bootstrap and advantage propagation
    pub use_news: bool,
}

impl Default for PPOConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            n_epochs: 4,
            n_minibatches: 8,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_range: 0.1,
            clip_range_vf: None,
            vf_coef: 0.5,
            ent_coef: 1e-3,
            max_grad_norm: None,
            norm_adv: true,
            use_news: false,
        }
    }
}

impl PPOConfig {
    /// Create a new PPO config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set learning rate
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set number of training epochs
    pub fn n_epochs(mut self, epochs: usize) -> Self {
        self.n_epochs = epochs;
        self
    }

    /// Set number of minibatches per epoch
    pub fn n_minibatches(mut self, n: usize) -> Self {
        self.n_minibatches = n;
        self
    }

    /// Set discount factor
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    /// Set GAE lambda
    pub fn gae_lambda(mut self, lambda: f64) -> Self {
        self.gae_lambda = lambda;
        self
    }

    /// Set PPO clip range
    pub fn clip_range(mut self, clip: f64) -> Self {
        self.clip_range = clip;
        self
    }

    /// Set value function clip range
    pub fn clip_range_vf(mut self, clip: f64) -> Self {
        self.clip_range_vf = Some(clip);
        self
    }

    /// Set value function coefficient
    pub fn vf_coef(mut self, coef: f64) -> Self {
        self.vf_coef = coef;
        self
    }

    /// Set entropy coefficient
    pub fn ent_coef(mut self, coef: f64) -> Self {
        self.ent_coef = coef;
        self
    }

    /// Set maximum gradient norm
    pub fn max_grad_norm(mut self, norm: f64) -> Self {
        self.max_grad_norm = Some(norm);
        self
    }

    /// Toggle advantage normalization
    pub fn norm_adv(mut self, enabled: bool) -> Self {
        self.norm_adv = enabled;
        self
    }

    /// Toggle episode-boundary masking
    pub fn use_news(mut self, enabled: bool) -> Self {
        self.use_news = enabled;
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            bail!("Learning rate must be positive");
        }
        if self.n_epochs == 0 {
            bail!("Number of epochs must be positive");
        }
        if self.n_minibatches == 0 {
            bail!("Number of minibatches must be positive");
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            bail!("Gamma must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.gae_lambda) {
            bail!("GAE lambda must be in [0, 1]");
        }
        if self.clip_range <= 0.0 {
            bail!("Clip range must be positive");
        }
        if let Some(clip) = self.clip_range_vf
            && clip <= 0.0
        {
            bail!("Value clip range must be positive");
        }
        if self.vf_coef < 0.0 {
            bail!("Value function coefficient must be non-negative");
        }
        if self.ent_coef < 0.0 {
            bail!("Entropy coefficient must be non-negative");
        }
        if let Some(norm) = self.max_grad_norm
            && norm <= 0.0
        {
            bail!("Max gradient norm must be positive");
        }
        Ok(())
    }
}

/// Segment collection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Parallel environments (E)
    pub num_envs: usize,

    /// Groups the pool steps in parallel
    pub nlumps: usize,

    /// Steps per segment (T)
    pub nsteps_per_seg: usize,

    /// Random-agent steps used to fit observation statistics before training
    pub obs_norm_steps: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self { num_envs: 8, nlumps: 1, nsteps_per_seg: 128, obs_norm_steps: 10_000 }
    }
}

/// Reward shaping settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Weight of the extrinsic reward
    pub ext_coeff: f64,

    /// Weight of the normalized intrinsic reward
    pub int_coeff: f64,

    /// Divide intrinsic rewards by the spread of their discounted sums
    pub norm_rew: bool,

    /// Clip extrinsic rewards to [-1, 1]
    pub clip_ext_rew: bool,

    /// Scale extrinsic rewards the same way as intrinsic ones
    pub norm_ext_rew: bool,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            ext_coeff: 1.0,
            int_coeff: 1.0,
            norm_rew: true,
            clip_ext_rew: true,
            norm_ext_rew: false,
        }
    }
}

/// Network settings outside the dynamics ensemble
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub policy: MlpConfig,
    pub features: FeatureConfig,
    /// Feed extractor features to the policy instead of observations
    pub policy_on_features: bool,
}

/// Complete configuration of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Environment-step budget
    pub num_timesteps: usize,
    pub ppo: PPOConfig,
    pub rollout: RolloutConfig,
    pub reward: RewardConfig,
    pub dynamics: DynamicsConfig,
    pub model: ModelConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_timesteps: 1_000_448,
            ppo: PPOConfig::default(),
            rollout: RolloutConfig::default(),
            reward: RewardConfig::default(),
            dynamics: DynamicsConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Transitions per segment (T * E)
    pub fn segment_size(&self) -> usize {
        self.rollout.nsteps_per_seg * self.rollout.num_envs
    }

    /// Validate every section and the combinations between them
    pub fn validate(&self) -> Result<()> {
        self.ppo.validate().context("invalid PPO configuration")?;

        let rollout = &self.rollout;
        if rollout.num_envs == 0 || rollout.nsteps_per_seg == 0 {
            bail!("num_envs and nsteps_per_seg must be positive");
        }
        if rollout.nlumps == 0 || rollout.num_envs % rollout.nlumps != 0 {
            bail!(
                "nlumps ({}) must be positive and divide num_envs ({})",
                rollout.nlumps,
                rollout.num_envs
            );
        }
        if self.segment_size() % self.ppo.n_minibatches != 0 {
            bail!(
                "segment of {} transitions cannot be split into {} equal minibatches",
                self.segment_size(),
                self.ppo.n_minibatches
            );
        }

        let dynamics = &self.dynamics;
        if dynamics.num_dynamics == 0 {
            bail!("num_dynamics must be at least 1");
        }
        if self.reward.int_coeff > 0.0 && dynamics.num_dynamics < 2 {
            bail!(
                "int_coeff is {} but disagreement needs at least two dynamics models \
                 (num_dynamics = {})",
                self.reward.int_coeff,
                dynamics.num_dynamics
            );
        }
        if !(dynamics.subset_fraction > 0.0 && dynamics.subset_fraction <= 1.0) {
            bail!("subset_fraction must be in (0, 1], got {}", dynamics.subset_fraction);
        }
        if dynamics.hidden_dim <= 0 {
            bail!("dynamics hidden_dim must be positive");
        }

        let features = &self.model.features;
        if features.feat_dim <= 0 || features.hidden_dim <= 0 {
            bail!("feat_dim and hidden_dim must be positive");
        }
        if self.model.policy.hidden_dim <= 0 {
            bail!("policy hidden_dim must be positive");
        }
        if self.reward.ext_coeff < 0.0 || self.reward.int_coeff < 0.0 {
            bail!("reward coefficients must be non-negative");
        }
        Ok(())
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening config {}", path.display()))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureLearning;

    #[test]
    fn test_default_config() {
        let config = TrainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ppo.learning_rate, 1e-4);
        assert_eq!(config.ppo.clip_range, 0.1);
        assert_eq!(config.segment_size(), 1024);
        assert_eq!(config.dynamics.num_dynamics, 5);
        assert!(config.dynamics.var_output);
        assert!(!config.ppo.use_news);
    }

    #[test]
    fn test_ppo_validation() {
        assert!(PPOConfig::new().validate().is_ok());
        assert!(PPOConfig::new().learning_rate(-1.0).validate().is_err());
        assert!(PPOConfig::new().gamma(1.5).validate().is_err());
        assert!(PPOConfig::new().n_epochs(0).validate().is_err());
        assert!(PPOConfig::new().n_minibatches(0).validate().is_err());
        assert!(PPOConfig::new().clip_range(-0.1).validate().is_err());
        assert!(PPOConfig::new().max_grad_norm(0.0).validate().is_err());
        assert!(PPOConfig::new().vf_coef(0.0).validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PPOConfig::new().learning_rate(1e-3).n_epochs(5).gamma(0.95).use_news(true);

        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.n_epochs, 5);
        assert_eq!(config.gamma, 0.95);
        assert!(config.use_news);

        // Other values should remain default
        assert_eq!(config.gae_lambda, 0.95);
        assert_eq!(config.n_minibatches, 8);
    }

    #[test]
    fn test_disagreement_needs_two_models() {
        let mut config = TrainConfig::default();
        config.dynamics.num_dynamics = 1;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("at least two dynamics models"), "{err}");

        // Fine when the intrinsic reward is off
        config.reward.int_coeff = 0.0;
        assert!(config.validate().is_ok());

        config.dynamics.num_dynamics = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_minibatch_split_must_be_even() {
        let mut config = TrainConfig::default();
        config.rollout.num_envs = 3;
        config.rollout.nsteps_per_seg = 5;
        assert!(config.validate().is_err());

        config.ppo.n_minibatches = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lumps_must_divide_envs() {
        let mut config = TrainConfig::default();
        config.rollout.nlumps = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_subset_fraction_range() {
        let mut config = TrainConfig::default();
        config.dynamics.subset_fraction = 0.0;
        assert!(config.validate().is_err());
        config.dynamics.subset_fraction = 0.25;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip_with_partial_input() {
        let json = r#"{ "num_timesteps": 4096, "ppo": { "use_news": true },
                        "model": { "features": { "feat_learning": "idf" },
                                   "policy": { "hidden_dim": 64 } } }"#;
        let config: TrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_timesteps, 4096);
        assert!(config.ppo.use_news);
        assert_eq!(config.ppo.n_epochs, 4);
        assert_eq!(config.model.features.feat_learning, FeatureLearning::Idf);
        assert_eq!(config.model.policy.hidden_dim, 64);
        assert_eq!(config.model.policy.num_layers, 2);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        config.to_json_file(&path).unwrap();
        let loaded = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
