//! Vectorized environment pool for parallel execution
//!
//! Environments are grouped into "lumps". Lumps are stepped in parallel on
//! Rayon's thread pool while the environments inside one lump are stepped
//! sequentially, which amortizes scheduling overhead for cheap environments.
//!
//! The pool auto-resets: when an environment reports the end of an episode,
//! the reset observation is returned for the next timestep while the
//! terminal reward and done flag from the finishing step are still reported.
//!
//! # Example
//!
//! ```rust,no_run
//! use disagree_rl::env::{countdown::Countdown, pool::EnvPool};
//!
//! // 4 environments split into 2 lumps
//! let mut pool = EnvPool::new(|i| Ok(Countdown::new(i, 10)), 4, 2).unwrap();
//! let observations = pool.reset_all().unwrap();
//! let step = pool.step(&[0, 0, 0, 0]).unwrap();
//! assert_eq!(step.rewards.len(), observations.len());
//! ```

use anyhow::{Context, Result, bail};
use rayon::prelude::*;

use crate::env::{EpisodeInfo, Environment, SpaceInfo, StepInfo};

/// A pool of environments for parallel execution
pub struct EnvPool<E: Environment> {
    /// Environment instances, grouped into lumps
    lumps: Vec<Vec<Slot<E>>>,

    /// Number of environments
    num_envs: usize,

    observation_space: SpaceInfo,
    action_space: SpaceInfo,
}

/// One environment plus its running episode counters
struct Slot<E> {
    env: E,
    episode_reward: f32,
    episode_length: usize,
}

/// Result of stepping every environment in the pool once
#[derive(Debug, Clone)]
pub struct PoolStep {
    /// Observations for the next timestep (reset observations where an
    /// episode just ended)
    pub observations: Vec<Vec<f32>>,

    /// Rewards for each environment
    pub rewards: Vec<f32>,

    /// Episode-end flags (terminated or truncated)
    pub dones: Vec<bool>,

    /// Per-environment info
    pub infos: Vec<StepInfo>,
}

impl<E: Environment> EnvPool<E> {
    /// Create a new environment pool
    ///
    /// # Arguments
    ///
    /// * `env_fn` - Factory receiving the environment index
    /// * `num_envs` - Number of parallel environments
    /// * `nlumps` - Number of groups stepped in parallel; must divide
    ///   `num_envs`
    pub fn new<F>(env_fn: F, num_envs: usize, nlumps: usize) -> Result<Self>
    where
        F: Fn(usize) -> Result<E>,
    {
        if num_envs == 0 {
            bail!("EnvPool needs at least one environment");
        }
        if nlumps == 0 || num_envs % nlumps != 0 {
            bail!("nlumps ({nlumps}) must evenly divide num_envs ({num_envs})");
        }

        let per_lump = num_envs / nlumps;
        let mut lumps = Vec::with_capacity(nlumps);
        for lump_id in 0..nlumps {
            let mut lump = Vec::with_capacity(per_lump);
            for offset in 0..per_lump {
                let env_id = lump_id * per_lump + offset;
                let env = env_fn(env_id)
                    .with_context(|| format!("failed to create environment {env_id}"))?;
                lump.push(Slot { env, episode_reward: 0.0, episode_length: 0 });
            }
            lumps.push(lump);
        }

        let first = &lumps[0][0].env;
        let observation_space = first.observation_space();
        let action_space = first.action_space();

        for (env_id, slot) in lumps.iter().flatten().enumerate() {
            if slot.env.observation_space() != observation_space
                || slot.env.action_space() != action_space
            {
                bail!("environment {env_id} has spaces that differ from environment 0");
            }
        }

        Ok(Self { lumps, num_envs, observation_space, action_space })
    }

    /// Reset all environments in parallel
    ///
    /// Returns one initial observation per environment, in index order.
    pub fn reset_all(&mut self) -> Result<Vec<Vec<f32>>> {
        let per_lump = self.envs_per_lump();
        let obs_dim = self.observation_space.flat_dim();
        let observations: Vec<Vec<Vec<f32>>> = self
            .lumps
            .par_iter_mut()
            .enumerate()
            .map(|(lump_id, lump)| {
                lump.iter_mut()
                    .enumerate()
                    .map(|(offset, slot)| {
                        slot.episode_reward = 0.0;
                        slot.episode_length = 0;
                        slot.env
                            .reset()
                            .and_then(|obs| check_observation(obs, obs_dim))
                            .with_context(|| {
                                format!(
                                    "environment {} failed to reset",
                                    lump_id * per_lump + offset
                                )
                            })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(observations.into_iter().flatten().collect())
    }

    /// Step all environments with the given actions
    ///
    /// Any environment error aborts the whole step; the returned error names
    /// the failing environment.
    ///
    /// # Panics
    ///
    /// Panics if the number of actions doesn't match the number of
    /// environments.
    pub fn step(&mut self, actions: &[i64]) -> Result<PoolStep> {
        assert_eq!(
            actions.len(),
            self.num_envs,
            "Number of actions must match number of environments"
        );

        let per_lump = self.envs_per_lump();
        let obs_dim = self.observation_space.flat_dim();
        let lump_results: Vec<Vec<(Vec<f32>, f32, bool, StepInfo)>> = self
            .lumps
            .par_iter_mut()
            .zip(actions.par_chunks(per_lump))
            .enumerate()
            .map(|(lump_id, (lump, lump_actions))| {
                lump.iter_mut()
                    .zip(lump_actions)
                    .enumerate()
                    .map(|(offset, (slot, &action))| {
                        let env_id = lump_id * per_lump + offset;
                        step_slot(slot, action, obs_dim)
                            .with_context(|| format!("environment {env_id} failed to step"))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let mut observations = Vec::with_capacity(self.num_envs);
        let mut rewards = Vec::with_capacity(self.num_envs);
        let mut dones = Vec::with_capacity(self.num_envs);
        let mut infos = Vec::with_capacity(self.num_envs);

        for (observation, reward, done, info) in lump_results.into_iter().flatten() {
            observations.push(observation);
            rewards.push(reward);
            dones.push(done);
            infos.push(info);
        }

        Ok(PoolStep { observations, rewards, dones, infos })
    }

    /// Close every environment
    pub fn close(&mut self) -> Result<()> {
        for (env_id, slot) in self.lumps.iter_mut().flatten().enumerate() {
            slot.env.close().with_context(|| format!("environment {env_id} failed to close"))?;
        }
        Ok(())
    }

    /// Get the number of environments in the pool
    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    /// Get the number of lumps
    pub fn num_lumps(&self) -> usize {
        self.lumps.len()
    }

    /// Observation space shared by all environments
    pub fn observation_space(&self) -> &SpaceInfo {
        &self.observation_space
    }

    /// Action space shared by all environments
    pub fn action_space(&self) -> &SpaceInfo {
        &self.action_space
    }

    fn envs_per_lump(&self) -> usize {
        self.num_envs / self.lumps.len()
    }
}

/// Reject observations that would corrupt the rollout buffer or the
/// normalizer downstream
fn check_observation(observation: Vec<f32>, obs_dim: usize) -> Result<Vec<f32>> {
    if observation.len() != obs_dim {
        bail!("observation has {} values, space declares {obs_dim}", observation.len());
    }
    if let Some(i) = observation.iter().position(|v| !v.is_finite()) {
        bail!("non-finite observation value {} at index {i}", observation[i]);
    }
    Ok(observation)
}

fn step_slot<E: Environment>(
    slot: &mut Slot<E>,
    action: i64,
    obs_dim: usize,
) -> Result<(Vec<f32>, f32, bool, StepInfo)> {
    let result = slot.env.step(action)?;
    let done = result.done();
    let mut info = result.info;
    let next_obs = check_observation(result.observation, obs_dim)?;

    slot.episode_reward += result.reward;
    slot.episode_length += 1;

    let observation = if done {
        info.episode =
            Some(EpisodeInfo { reward: slot.episode_reward, length: slot.episode_length });
        info.terminal_observation = Some(next_obs);
        slot.episode_reward = 0.0;
        slot.episode_length = 0;
        check_observation(slot.env.reset()?, obs_dim)?
    } else {
        next_obs
    };

    Ok((observation, result.reward, done, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::countdown::Countdown;
    use crate::env::gridworld::KeyDoorGrid;
    use crate::env::StepResult;

    /// Declares a 2-dim observation space but steps to `bad`
    struct Malformed {
        bad: Vec<f32>,
    }

    impl Environment for Malformed {
        fn reset(&mut self) -> Result<Vec<f32>> {
            Ok(vec![0.0, 0.0])
        }

        fn step(&mut self, _action: i64) -> Result<StepResult> {
            Ok(StepResult {
                observation: self.bad.clone(),
                reward: 0.0,
                terminated: false,
                truncated: false,
                info: StepInfo::default(),
            })
        }

        fn observation_space(&self) -> SpaceInfo {
            SpaceInfo::vector(2)
        }

        fn action_space(&self) -> SpaceInfo {
            SpaceInfo::discrete(2)
        }
    }

    #[test]
    fn test_pool_creation() {
        let pool = EnvPool::new(|i| Ok(Countdown::new(i, 5)), 4, 2).unwrap();
        assert_eq!(pool.num_envs(), 4);
        assert_eq!(pool.num_lumps(), 2);
    }

    #[test]
    fn test_pool_rejects_uneven_lumps() {
        assert!(EnvPool::new(|i| Ok(Countdown::new(i, 5)), 4, 3).is_err());
        assert!(EnvPool::new(|i| Ok(Countdown::new(i, 5)), 0, 1).is_err());
    }

    #[test]
    fn test_pool_reset_keeps_index_order() {
        let mut pool = EnvPool::new(|i| Ok(Countdown::new(i, 5)), 6, 3).unwrap();
        let observations = pool.reset_all().unwrap();

        assert_eq!(observations.len(), 6);
        for (env_id, obs) in observations.iter().enumerate() {
            assert_eq!(obs, &vec![0.0, env_id as f32]);
        }
    }

    #[test]
    fn test_pool_auto_reset() {
        let mut pool = EnvPool::new(|i| Ok(Countdown::new(i, 2 + i)), 2, 1).unwrap();
        pool.reset_all().unwrap();

        let first = pool.step(&[0, 0]).unwrap();
        assert_eq!(first.dones, vec![false, false]);

        // Env 0 finishes on its second step, env 1 keeps going
        let second = pool.step(&[0, 0]).unwrap();
        assert_eq!(second.dones, vec![true, false]);
        assert_eq!(second.rewards, vec![1.0, 1.0]);
        assert_eq!(second.observations[0], vec![0.0, 0.0]);
        assert_eq!(second.infos[0].terminal_observation, Some(vec![2.0, 0.0]));
        assert_eq!(second.infos[0].episode, Some(EpisodeInfo { reward: 2.0, length: 2 }));
        assert_eq!(second.observations[1], vec![2.0, 1.0]);
        assert!(second.infos[1].episode.is_none());
    }

    #[test]
    fn test_pool_surfaces_environment_errors() {
        let mut pool = EnvPool::new(|i| Ok(Countdown::new(i, 5).fail_at_step(3)), 2, 2).unwrap();
        pool.reset_all().unwrap();
        pool.step(&[0, 0]).unwrap();
        pool.step(&[0, 0]).unwrap();

        let err = pool.step(&[0, 0]).unwrap_err();
        assert!(format!("{err:#}").contains("failed to step"));
    }

    #[test]
    #[should_panic(expected = "Number of actions must match number of environments")]
    fn test_pool_step_wrong_action_count() {
        let mut pool = EnvPool::new(|i| Ok(Countdown::new(i, 5)), 4, 1).unwrap();
        pool.reset_all().unwrap();
        let _ = pool.step(&[0, 1]);
    }

    #[test]
    fn test_pool_spaces() {
        let pool = EnvPool::new(|i| Ok(KeyDoorGrid::new(6, i as u64)), 4, 2).unwrap();
        assert_eq!(pool.observation_space().flat_dim(), KeyDoorGrid::new(6, 0).obs_dim());
        assert_eq!(pool.action_space().dtype, crate::env::SpaceType::Discrete(4));
    }

    #[test]
    fn test_pool_many_steps_gridworld() {
        let mut pool = EnvPool::new(|i| Ok(KeyDoorGrid::new(6, i as u64)), 8, 4).unwrap();
        let observations = pool.reset_all().unwrap();
        assert_eq!(observations.len(), 8);

        for i in 0..200 {
            let actions: Vec<i64> = (0..8).map(|j| ((i + j) % 4) as i64).collect();
            let step = pool.step(&actions).unwrap();
            assert_eq!(step.observations.len(), 8);
            for (obs, info) in step.observations.iter().zip(&step.infos) {
                assert_eq!(obs.len(), observations[0].len());
                if let Some(terminal) = &info.terminal_observation {
                    assert_eq!(terminal.len(), obs.len());
                }
            }
        }
    }

    #[test]
    fn test_pool_rejects_wrong_observation_length() {
        let make = |i: usize| Ok(Malformed { bad: vec![0.0; if i == 1 { 3 } else { 2 }] });
        let mut pool = EnvPool::new(make, 2, 1).unwrap();
        pool.reset_all().unwrap();

        let err = pool.step(&[0, 0]).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("environment 1"), "{message}");
        assert!(message.contains("3 values"), "{message}");
    }

    #[test]
    fn test_pool_rejects_non_finite_observation() {
        let mut pool = EnvPool::new(|_| Ok(Malformed { bad: vec![0.0, f32::NAN] }), 2, 2).unwrap();
        pool.reset_all().unwrap();

        let err = pool.step(&[0, 0]).unwrap_err();
        assert!(format!("{err:#}").contains("non-finite observation"));
    }
}
