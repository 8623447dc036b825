//! Proximal Policy Optimization (PPO) with a disagreement bonus
//!
//! The agent is trained with clipped-surrogate PPO on a mix of the
//! environment's reward and an intrinsic reward: the variance of the next-
//! feature predictions of an ensemble of forward-dynamics models. Transitions
//! the ensemble disagrees about are ones the agent hasn't learned to predict,
//! which pays it to go looking for them.
//!
//! # Algorithm Overview
//!
//! ```text
//! For each update:
//!   1. Collect a segment with the current policy
//!   2. Score transitions with the ensemble's disagreement
//!   3. Normalize intrinsic rewards, mix in extrinsic rewards
//!   4. Compute advantages using GAE
//!   5. For n_epochs:
//!      a. Split the segment into n_minibatches
//!      b. PPO loss + feature auxiliary loss + dynamics loss
//!      c. One Adam step over every network
//! ```
//!
//! # References
//!
//! - [Proximal Policy Optimization Algorithms](https://arxiv.org/abs/1707.06347)
//! - [Self-Supervised Exploration via Disagreement](https://arxiv.org/abs/1906.04161)
//! - [Large-Scale Study of Curiosity-Driven Learning](https://arxiv.org/abs/1808.04355)

pub mod config;
pub mod loss;
pub mod optimizer;
pub mod stats;

pub use config::{ModelConfig, PPOConfig, RewardConfig, RolloutConfig, TrainConfig};
pub use loss::{compute_entropy_loss, compute_policy_loss, compute_value_loss, surrogate_terms};
pub use optimizer::{OptimizerState, PpoOptimizer, StepOutput};
pub use stats::TrainingStats;
