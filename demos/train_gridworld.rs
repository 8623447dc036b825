//! Explore a key-and-door grid world with disagreement rewards
//!
//! The extrinsic reward is only paid at the goal, behind a locked door, so
//! early progress comes almost entirely from the intrinsic bonus. Each
//! environment tracks the cells it has visited, reported as `coverage`.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example train_gridworld --release
//! cargo run --example train_gridworld --release -- config.json runs/gridworld
//! ```

use std::path::PathBuf;

use anyhow::Result;
use disagree_rl::env::gridworld::KeyDoorGrid;
use disagree_rl::env::wrappers::StateCoverage;
use disagree_rl::prelude::*;

const GRID_SIZE: usize = 8;
const SEED: u64 = 0;
const CHECKPOINT_EVERY: usize = 50;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => TrainConfig::from_json_file(path)?,
        None => {
            let mut config = TrainConfig::default();
            config.num_timesteps = 2_000_000;
            config.model.policy.hidden_dim = 128;
            config.model.features.feat_dim = 64;
            config.model.features.hidden_dim = 128;
            config.dynamics.hidden_dim = 128;
            config.dynamics.n_blocks = 2;
            config
        }
    };
    let run_dir = PathBuf::from(args.get(2).map_or("runs/gridworld", String::as_str));
    std::fs::create_dir_all(&run_dir)?;
    config.to_json_file(run_dir.join("config.json"))?;

    let ctx = RunContext::new(SEED, 0);
    tracing::info!(
        grid = GRID_SIZE,
        num_envs = config.rollout.num_envs,
        num_timesteps = config.num_timesteps,
        feat_learning = %config.model.features.feat_learning,
        device = ?ctx.device,
        run_dir = %run_dir.display(),
        "starting gridworld run"
    );

    let make = |i: usize| Ok(StateCoverage::new(KeyDoorGrid::new(GRID_SIZE, ctx.env_seed(i))));
    let pool = EnvPool::new(make, config.rollout.num_envs, config.rollout.nlumps)?;
    let optimizer =
        PpoOptimizer::new(config, &ctx, pool.observation_space(), pool.action_space())?;

    let sink: Vec<Box<dyn MetricsSink>> = vec![
        Box::new(TracingSink::new(10)),
        Box::new(JsonLinesSink::create(&run_dir.join("progress.jsonl"))?),
    ];
    let mut trainer = Trainer::new(optimizer, sink)
        .with_checkpoints(run_dir.join("checkpoint"), CHECKPOINT_EVERY);
    let summary = trainer.train(pool)?;

    tracing::info!(
        n_updates = summary.n_updates,
        tcount = summary.tcount,
        episodes = summary.episodes,
        best_ext_ret = ?summary.best_ext_ret,
        recent_ext_ret = ?summary.recent_ext_ret,
        "done"
    );
    Ok(())
}
