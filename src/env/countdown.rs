//! Scripted deterministic environment
//!
//! Pays a reward of 1.0 on every step and ends the episode after a fixed
//! number of steps. The observation is `[steps_taken, env_id]`, so tests can
//! tell exactly which environment and which point of its stream a recorded
//! transition came from.

use anyhow::{Result, bail};

use crate::env::{Environment, SpaceInfo, StepInfo, StepResult};

/// Fixed-length episode with a constant reward stream
#[derive(Debug, Clone)]
pub struct Countdown {
    env_id: usize,
    episode_len: usize,
    steps: usize,
    num_actions: usize,
    total_steps: usize,
    fail_at: Option<usize>,
    nan_reward_at: Option<usize>,
}

impl Countdown {
    /// Create an environment whose episodes last `episode_len` steps
    pub fn new(env_id: usize, episode_len: usize) -> Self {
        Self {
            env_id,
            episode_len,
            steps: 0,
            num_actions: 2,
            total_steps: 0,
            fail_at: None,
            nan_reward_at: None,
        }
    }

    /// Make the `n`-th call to `step` (counting from 1 across episodes) fail
    pub fn fail_at_step(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    /// Make the `n`-th call to `step` pay a NaN reward instead of 1.0
    pub fn nan_reward_at_step(mut self, n: usize) -> Self {
        self.nan_reward_at = Some(n);
        self
    }

    /// Set the size of the discrete action space
    pub fn with_num_actions(mut self, n: usize) -> Self {
        self.num_actions = n;
        self
    }

    fn observation(&self) -> Vec<f32> {
        vec![self.steps as f32, self.env_id as f32]
    }
}

impl Environment for Countdown {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.steps = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: i64) -> Result<StepResult> {
        self.total_steps += 1;
        if self.fail_at == Some(self.total_steps) {
            bail!("scripted failure at step {}", self.total_steps);
        }
        if action < 0 || action as usize >= self.num_actions {
            bail!("action {action} out of range for {} actions", self.num_actions);
        }

        self.steps += 1;
        let reward = if self.nan_reward_at == Some(self.total_steps) { f32::NAN } else { 1.0 };
        Ok(StepResult {
            observation: self.observation(),
            reward,
            terminated: self.steps >= self.episode_len,
            truncated: false,
            info: StepInfo::default(),
        })
    }

    fn observation_space(&self) -> SpaceInfo {
        SpaceInfo::vector(2)
    }

    fn action_space(&self) -> SpaceInfo {
        SpaceInfo::discrete(self.num_actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countdown_episode() {
        let mut env = Countdown::new(3, 2);
        assert_eq!(env.reset().unwrap(), vec![0.0, 3.0]);

        let first = env.step(0).unwrap();
        assert_eq!(first.observation, vec![1.0, 3.0]);
        assert!(!first.done());

        let second = env.step(1).unwrap();
        assert_eq!(second.reward, 1.0);
        assert!(second.done());
    }

    #[test]
    fn test_countdown_nan_reward() {
        let mut env = Countdown::new(0, 5).nan_reward_at_step(2);
        env.reset().unwrap();
        assert_eq!(env.step(0).unwrap().reward, 1.0);
        assert!(env.step(0).unwrap().reward.is_nan());
        assert_eq!(env.step(0).unwrap().reward, 1.0);
    }

    #[test]
    fn test_countdown_rejects_bad_action() {
        let mut env = Countdown::new(0, 2);
        env.reset().unwrap();
        assert!(env.step(5).is_err());
    }
}
