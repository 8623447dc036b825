//! Training algorithms
//!
//! This module implements PPO with a disagreement bonus, the loop that runs
//! it against a timestep budget, checkpointing and metric sinks.

pub mod checkpoint;
pub mod metrics;
pub mod ppo;
pub mod trainer;

pub use checkpoint::CheckpointState;
pub use metrics::{JsonLinesSink, MemorySink, MetricsSink, TracingSink};
pub use ppo::{
    OptimizerState, PPOConfig, PpoOptimizer, StepOutput, TrainConfig, TrainingStats,
    compute_policy_loss, compute_value_loss,
};
pub use trainer::{TrainSummary, Trainer};
