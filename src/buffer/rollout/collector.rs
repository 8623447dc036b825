//! Segment collection from an environment pool
//!
//! The collector owns the pool, the per-environment current observations and
//! the rollout buffer. Observations carry over between segments: a segment is
//! a contiguous slice of each environment's stream, not a fresh episode.

use std::collections::VecDeque;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::storage::{RolloutBuffer, Transition};
use crate::env::pool::EnvPool;
use crate::env::{EpisodeInfo, Environment};

/// Batched policy output for one timestep
#[derive(Debug, Clone, Default)]
pub struct ActOutput {
    /// Sampled actions [num_envs]
    pub actions: Vec<i64>,

    /// Value estimates [num_envs]
    pub values: Vec<f32>,

    /// Log probabilities of the sampled actions [num_envs]
    pub log_probs: Vec<f32>,
}

/// Anything that can drive segment collection
///
/// Implemented by the trained agent and by scripted policies in tests.
pub trait SegmentPolicy {
    /// Choose actions for a batch of raw observations
    fn act(&mut self, observations: &[Vec<f32>]) -> Result<ActOutput>;

    /// Value estimates for a batch of raw observations
    fn value(&mut self, observations: &[Vec<f32>]) -> Result<Vec<f32>>;
}

/// Running episode counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStats {
    /// Total environment steps taken
    pub tcount: usize,

    /// Completed episodes
    pub episodes: usize,

    /// Best extrinsic episode return so far
    pub best_ext_ret: Option<f32>,

    /// Mean state coverage across environments at the latest step, if the
    /// environments report it
    #[serde(default)]
    pub coverage: Option<f64>,

    recent_returns: VecDeque<f32>,
    recent_lengths: VecDeque<usize>,
    window: usize,
}

impl EpisodeStats {
    /// Track the last `window` episodes
    pub fn new(window: usize) -> Self {
        Self {
            tcount: 0,
            episodes: 0,
            best_ext_ret: None,
            coverage: None,
            recent_returns: VecDeque::with_capacity(window),
            recent_lengths: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    /// Record a finished episode
    pub fn record_episode(&mut self, episode: EpisodeInfo) {
        self.episodes += 1;
        self.best_ext_ret = Some(match self.best_ext_ret {
            Some(best) => best.max(episode.reward),
            None => episode.reward,
        });

        if self.recent_returns.len() == self.window {
            self.recent_returns.pop_front();
            self.recent_lengths.pop_front();
        }
        self.recent_returns.push_back(episode.reward);
        self.recent_lengths.push_back(episode.length);
    }

    /// Mean return over the recent window
    pub fn mean_recent_return(&self) -> Option<f64> {
        if self.recent_returns.is_empty() {
            return None;
        }
        let sum: f64 = self.recent_returns.iter().map(|&r| r as f64).sum();
        Some(sum / self.recent_returns.len() as f64)
    }

    /// Mean length over the recent window
    pub fn mean_recent_length(&self) -> Option<f64> {
        if self.recent_lengths.is_empty() {
            return None;
        }
        let sum: usize = self.recent_lengths.iter().sum();
        Some(sum as f64 / self.recent_lengths.len() as f64)
    }
}

/// Collects fixed-length segments from an [`EnvPool`]
pub struct SegmentCollector<E: Environment> {
    pool: EnvPool<E>,
    buffer: RolloutBuffer,
    current_obs: Vec<Vec<f32>>,
    stats: EpisodeStats,
    segments: usize,
}

impl<E: Environment> SegmentCollector<E> {
    /// Reset every environment and size a buffer for `num_steps` per segment
    pub fn new(mut pool: EnvPool<E>, num_steps: usize) -> Result<Self> {
        ensure!(num_steps > 0, "segment length must be positive");
        let obs_dim = pool.observation_space().flat_dim();
        let current_obs = pool.reset_all()?;
        let buffer = RolloutBuffer::new(num_steps, pool.num_envs(), obs_dim);

        Ok(Self { pool, buffer, current_obs, stats: EpisodeStats::new(100), segments: 0 })
    }

    /// Collect one segment, then store the bootstrap values for the
    /// observations the next segment will start from
    pub fn collect_segment<P: SegmentPolicy + ?Sized>(&mut self, policy: &mut P) -> Result<()> {
        let (num_steps, num_envs, _) = self.buffer.shape();
        self.buffer.reset();

        for step in 0..num_steps {
            let out = policy.act(&self.current_obs)?;
            ensure!(
                out.actions.len() == num_envs
                    && out.values.len() == num_envs
                    && out.log_probs.len() == num_envs,
                "policy returned {} actions for {} environments",
                out.actions.len(),
                num_envs
            );

            let result = self.pool.step(&out.actions)?;

            for env_id in 0..num_envs {
                let info = &result.infos[env_id];
                let next_obs = info
                    .terminal_observation
                    .as_deref()
                    .unwrap_or(&result.observations[env_id]);

                self.buffer.add(
                    step,
                    env_id,
                    Transition {
                        observation: &self.current_obs[env_id],
                        next_observation: next_obs,
                        action: out.actions[env_id],
                        ext_reward: result.rewards[env_id],
                        value: out.values[env_id],
                        log_prob: out.log_probs[env_id],
                        done: result.dones[env_id],
                    },
                );

                if let Some(episode) = info.episode {
                    self.stats.record_episode(episode);
                }
            }

            let reported: Vec<f64> =
                result.infos.iter().filter_map(|info| info.coverage).map(f64::from).collect();
            if !reported.is_empty() {
                self.stats.coverage = Some(reported.iter().sum::<f64>() / reported.len() as f64);
            }

            self.stats.tcount += num_envs;
            self.current_obs = result.observations;
        }

        let last_values = policy.value(&self.current_obs)?;
        ensure!(
            last_values.len() == num_envs,
            "policy returned {} bootstrap values for {} environments",
            last_values.len(),
            num_envs
        );
        self.buffer.set_last_values(last_values);
        self.segments += 1;

        debug!(
            segment = self.segments,
            tcount = self.stats.tcount,
            dones = self.buffer.num_dones(),
            "collected segment"
        );
        Ok(())
    }

    pub fn buffer(&self) -> &RolloutBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut RolloutBuffer {
        &mut self.buffer
    }

    /// Observations the next segment starts from
    pub fn current_observations(&self) -> &[Vec<f32>] {
        &self.current_obs
    }

    pub fn stats(&self) -> &EpisodeStats {
        &self.stats
    }

    /// Replace counters, e.g. when resuming from a checkpoint
    pub fn set_stats(&mut self, stats: EpisodeStats) {
        self.stats = stats;
    }

    /// Number of segments collected
    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn num_envs(&self) -> usize {
        self.pool.num_envs()
    }

    /// Close every environment and hand back the pool
    pub fn into_pool(mut self) -> Result<EnvPool<E>> {
        self.pool.close()?;
        Ok(self.pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_stats_window() {
        let mut stats = EpisodeStats::new(2);
        assert_eq!(stats.mean_recent_return(), None);

        stats.record_episode(EpisodeInfo { reward: 1.0, length: 10 });
        stats.record_episode(EpisodeInfo { reward: 5.0, length: 20 });
        stats.record_episode(EpisodeInfo { reward: 3.0, length: 30 });

        assert_eq!(stats.episodes, 3);
        assert_eq!(stats.best_ext_ret, Some(5.0));
        assert_eq!(stats.mean_recent_return(), Some(4.0));
        assert_eq!(stats.mean_recent_length(), Some(25.0));
    }

    #[test]
    fn test_best_return_can_be_negative() {
        let mut stats = EpisodeStats::new(10);
        stats.record_episode(EpisodeInfo { reward: -3.0, length: 1 });
        stats.record_episode(EpisodeInfo { reward: -1.0, length: 1 });
        assert_eq!(stats.best_ext_ret, Some(-1.0));
    }
}
