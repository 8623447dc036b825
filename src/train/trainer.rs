//! Budgeted training loop
//!
//! [`Trainer`] drives a [`PpoOptimizer`] until `num_timesteps` environment
//! steps have been taken, forwarding every update's metrics to a
//! [`MetricsSink`] and optionally writing checkpoints along the way.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use super::metrics::MetricsSink;
use super::ppo::PpoOptimizer;
use crate::env::Environment;
use crate::env::pool::EnvPool;

/// Outcome of [`Trainer::train`]
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub n_updates: usize,
    pub tcount: usize,
    pub episodes: usize,
    pub best_ext_ret: Option<f32>,
    pub recent_ext_ret: Option<f64>,
}

struct CheckpointSchedule {
    dir: PathBuf,
    every: usize,
}

/// Runs updates until the timestep budget is spent
pub struct Trainer<E: Environment, S: MetricsSink> {
    optimizer: PpoOptimizer<E>,
    sink: S,
    checkpoints: Option<CheckpointSchedule>,
}

impl<E: Environment, S: MetricsSink> Trainer<E, S> {
    pub fn new(optimizer: PpoOptimizer<E>, sink: S) -> Self {
        Self { optimizer, sink, checkpoints: None }
    }

    /// Save to `dir` every `every` updates and once more at the end
    pub fn with_checkpoints(mut self, dir: impl Into<PathBuf>, every: usize) -> Self {
        self.checkpoints = Some(CheckpointSchedule { dir: dir.into(), every: every.max(1) });
        self
    }

    /// Train on `pool` until `num_timesteps` is reached
    ///
    /// The pool is closed when training ends, whether it succeeded or not.
    pub fn train(&mut self, pool: EnvPool<E>) -> Result<TrainSummary> {
        self.optimizer.start_interaction(pool)?;

        let result = self.run();
        if let Err(e) = &result {
            warn!(error = %e, n_updates = self.optimizer.n_updates(), "training aborted");
        }
        let stopped = self.optimizer.stop_interaction();
        let flushed = self.sink.flush();

        let summary = result?;
        stopped?;
        flushed?;
        Ok(summary)
    }

    fn run(&mut self) -> Result<TrainSummary> {
        let budget = self.optimizer.config().num_timesteps;
        while self.optimizer.tcount() < budget {
            let out = self.optimizer.step()?;
            let Some(metrics) = out.update else { continue };

            let n_updates = self.optimizer.n_updates();
            self.sink.record(n_updates, &metrics)?;

            if let Some(schedule) = &self.checkpoints
                && n_updates % schedule.every == 0
            {
                self.optimizer.save_checkpoint(&schedule.dir)?;
            }
        }

        if let Some(schedule) = &self.checkpoints
            && self.optimizer.n_updates() % schedule.every != 0
        {
            self.optimizer.save_checkpoint(&schedule.dir)?;
        }

        let summary = self.summary();
        info!(
            n_updates = summary.n_updates,
            tcount = summary.tcount,
            episodes = summary.episodes,
            "training finished"
        );
        Ok(summary)
    }

    /// Counters of the run so far
    pub fn summary(&self) -> TrainSummary {
        let stats = self.optimizer.episode_stats();
        TrainSummary {
            n_updates: self.optimizer.n_updates(),
            tcount: self.optimizer.tcount(),
            episodes: stats.map_or(0, |s| s.episodes),
            best_ext_ret: stats.and_then(|s| s.best_ext_ret),
            recent_ext_ret: stats.and_then(|s| s.mean_recent_return()),
        }
    }

    pub fn optimizer(&self) -> &PpoOptimizer<E> {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut PpoOptimizer<E> {
        &mut self.optimizer
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Give back the optimizer and the sink
    pub fn into_parts(self) -> (PpoOptimizer<E>, S) {
        (self.optimizer, self.sink)
    }
}
