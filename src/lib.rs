//! # disagree-rl
//!
//! Self-supervised exploration in Rust + libtorch
//!
//! An agent is trained with PPO on the environment's reward plus an
//! intrinsic bonus: how much an ensemble of forward-dynamics models disagrees
//! about the features of the next observation. Networks are built with
//! tch-rs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use disagree_rl::prelude::*;
//! use disagree_rl::env::gridworld::KeyDoorGrid;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = TrainConfig::default();
//! let ctx = RunContext::new(0, 0);
//! let make = |i: usize| Ok(KeyDoorGrid::new(8, ctx.env_seed(i)));
//! let pool = EnvPool::new(make, config.rollout.num_envs, config.rollout.nlumps)?;
//!
//! let optimizer =
//!     PpoOptimizer::new(config, &ctx, pool.observation_space(), pool.action_space())?;
//! let mut trainer = Trainer::new(optimizer, TracingSink::default());
//! let summary = trainer.train(pool)?;
//! println!("{} updates, best return {:?}", summary.n_updates, summary.best_ext_ret);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

/// Environment traits and implementations
pub mod env;

/// Actor-critic networks
pub mod policy;

/// Feature extractors the dynamics models predict in
pub mod features;

/// Forward-dynamics ensemble and its disagreement reward
pub mod dynamics;

/// Segment storage, advantage estimation and minibatching
pub mod buffer;

/// Training algorithms (PPO with a disagreement bonus)
pub mod train;

/// Utility functions and helpers
pub mod utils;

/// Prelude module for convenient imports
///
/// This module re-exports commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::env::pool::EnvPool;
    pub use crate::env::{Environment, SpaceInfo, SpaceType, StepResult};
    pub use crate::features::FeatureLearning;
    pub use crate::train::{
        JsonLinesSink, MemorySink, MetricsSink, PpoOptimizer, TracingSink, TrainConfig, Trainer,
    };
    pub use crate::utils::seeding::RunContext;
}

/// Current version of disagree-rl
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }
}
