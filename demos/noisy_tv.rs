//! Disagreement under a "noisy TV"
//!
//! Every observation of the grid world gets `NOISE_DIMS` fresh uniform
//! values appended, and with probability `STICKY_PROB` the chosen action is
//! replaced by a random one. A curiosity bonus based on prediction error
//! would keep paying for the noise; the variance of an ensemble trained on
//! the same targets settles instead. The demo trains with each feature
//! learner in turn and compares the intrinsic reward at the start and at the
//! end of training.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example noisy_tv --release
//! cargo run --example noisy_tv --release -- idf
//! ```

use anyhow::Result;
use disagree_rl::env::gridworld::KeyDoorGrid;
use disagree_rl::env::wrappers::{NoisyObservation, RandomAction};
use disagree_rl::prelude::*;

const GRID_SIZE: usize = 6;
const NOISE_DIMS: usize = 16;
const STICKY_PROB: f64 = 0.1;
const NUM_TIMESTEPS: usize = 200_000;

fn run(feat_learning: FeatureLearning, ctx: &RunContext) -> Result<(f64, f64)> {
    let mut config = TrainConfig::default();
    config.num_timesteps = NUM_TIMESTEPS;
    config.model.features.feat_learning = feat_learning;
    config.model.policy.hidden_dim = 128;
    config.model.features.feat_dim = 32;
    config.model.features.hidden_dim = 128;
    config.dynamics.hidden_dim = 128;
    config.dynamics.n_blocks = 2;

    let make = |i: usize| {
        let seed = ctx.env_seed(i);
        let grid = NoisyObservation::new(KeyDoorGrid::new(GRID_SIZE, seed), NOISE_DIMS, seed ^ 1);
        RandomAction::new(grid, STICKY_PROB, seed ^ 2)
    };
    let pool = EnvPool::new(make, config.rollout.num_envs, config.rollout.nlumps)?;
    let optimizer =
        PpoOptimizer::new(config, ctx, pool.observation_space(), pool.action_space())?;

    let mut memory = MemorySink::new();
    {
        let sinks: Vec<Box<dyn MetricsSink + '_>> =
            vec![Box::new(TracingSink::new(20)), Box::new(&mut memory)];
        Trainer::new(optimizer, sinks).train(pool)?;
    }

    let int_rewards = memory.series("rew/int_raw_mean");
    let window = (int_rewards.len() / 10).max(1);
    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len().max(1) as f64;
    let start = mean(&int_rewards[..window.min(int_rewards.len())]);
    let end = mean(&int_rewards[int_rewards.len().saturating_sub(window)..]);
    Ok((start, end))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args: Vec<String> = std::env::args().collect();
    let kinds = match args.get(1) {
        Some(name) => vec![FeatureLearning::parse(name)?],
        None => vec![FeatureLearning::None, FeatureLearning::Idf, FeatureLearning::Pixels],
    };

    let ctx = RunContext::new(0, 0);
    for kind in kinds {
        tracing::info!(feat_learning = %kind, noise_dims = NOISE_DIMS, "training");
        let (start, end) = run(kind, &ctx)?;
        tracing::info!(
            feat_learning = %kind,
            int_rew_start = start,
            int_rew_end = end,
            ratio = end / start,
            "intrinsic reward under noise"
        );
    }
    Ok(())
}
