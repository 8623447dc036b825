//! Rollout buffer storage and data management
//!
//! This module handles the core storage functionality for rollout buffers,
//! including data insertion, retrieval, and buffer management.

/// One recorded environment step
///
/// `next_observation` is the observation the step actually led to: the
/// terminal observation when the episode ended, not the reset observation
/// the pool hands back for the following timestep.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    /// Observation the action was chosen from
    pub observation: &'a [f32],

    /// Observation the step led to
    pub next_observation: &'a [f32],

    /// Action taken
    pub action: i64,

    /// Extrinsic reward received
    pub ext_reward: f32,

    /// Value estimate for `observation`
    pub value: f32,

    /// Log probability of `action`
    pub log_prob: f32,

    /// Whether the episode ended on this step
    pub done: bool,
}

/// Storage for one segment of `num_steps x num_envs` transitions
///
/// The segment is overwritten every collection cycle; nothing is kept across
/// cycles except what the collector tracks in its episode statistics.
#[derive(Debug, Clone)]
pub struct RolloutBuffer {
    /// Number of steps per segment
    num_steps: usize,

    /// Number of parallel environments
    num_envs: usize,

    /// Dimensionality of observations
    obs_dim: usize,

    /// Observations [num_steps, num_envs, obs_dim]
    observations: Vec<Vec<Vec<f32>>>,

    /// Observations the steps led to [num_steps, num_envs, obs_dim]
    next_observations: Vec<Vec<Vec<f32>>>,

    /// Actions taken [num_steps, num_envs]
    actions: Vec<Vec<i64>>,

    /// Extrinsic rewards [num_steps, num_envs]
    ext_rewards: Vec<Vec<f32>>,

    /// Raw intrinsic rewards [num_steps, num_envs]
    int_rewards: Vec<Vec<f32>>,

    /// Value estimates [num_steps, num_envs]
    values: Vec<Vec<f32>>,

    /// Log probabilities [num_steps, num_envs]
    log_probs: Vec<Vec<f32>>,

    /// Episode-end flags [num_steps, num_envs]
    dones: Vec<Vec<bool>>,

    /// Bootstrap values for the state after the last step [num_envs]
    last_values: Vec<f32>,

    /// Computed advantages [num_steps, num_envs]
    advantages: Vec<Vec<f32>>,

    /// Computed returns [num_steps, num_envs]
    returns: Vec<Vec<f32>>,
}

impl RolloutBuffer {
    /// Create a new rollout buffer
    ///
    /// # Arguments
    ///
    /// * `num_steps` - Number of timesteps per segment
    /// * `num_envs` - Number of parallel environments
    /// * `obs_dim` - Dimensionality of observations
    pub fn new(num_steps: usize, num_envs: usize, obs_dim: usize) -> Self {
        Self {
            num_steps,
            num_envs,
            obs_dim,
            observations: vec![vec![vec![0.0; obs_dim]; num_envs]; num_steps],
            next_observations: vec![vec![vec![0.0; obs_dim]; num_envs]; num_steps],
            actions: vec![vec![0; num_envs]; num_steps],
            ext_rewards: vec![vec![0.0; num_envs]; num_steps],
            int_rewards: vec![vec![0.0; num_envs]; num_steps],
            values: vec![vec![0.0; num_envs]; num_steps],
            log_probs: vec![vec![0.0; num_envs]; num_steps],
            dones: vec![vec![false; num_envs]; num_steps],
            last_values: vec![0.0; num_envs],
            advantages: vec![vec![0.0; num_envs]; num_steps],
            returns: vec![vec![0.0; num_envs]; num_steps],
        }
    }

    /// Record a transition
    ///
    /// # Panics
    ///
    /// Panics if `step`/`env_id` are out of range or the observation length
    /// doesn't match `obs_dim`.
    pub fn add(&mut self, step: usize, env_id: usize, transition: Transition<'_>) {
        assert!(step < self.num_steps, "step {} >= num_steps {}", step, self.num_steps);
        assert!(env_id < self.num_envs, "env_id {} >= num_envs {}", env_id, self.num_envs);
        assert_eq!(transition.observation.len(), self.obs_dim, "observation dimension mismatch");
        assert_eq!(
            transition.next_observation.len(),
            self.obs_dim,
            "observation dimension mismatch"
        );

        self.observations[step][env_id].copy_from_slice(transition.observation);
        self.next_observations[step][env_id].copy_from_slice(transition.next_observation);
        self.actions[step][env_id] = transition.action;
        self.ext_rewards[step][env_id] = transition.ext_reward;
        self.values[step][env_id] = transition.value;
        self.log_probs[step][env_id] = transition.log_prob;
        self.dones[step][env_id] = transition.done;
        self.int_rewards[step][env_id] = 0.0;
    }

    /// Store the bootstrap values for the state following the segment
    pub fn set_last_values(&mut self, last_values: Vec<f32>) {
        assert_eq!(last_values.len(), self.num_envs, "last_values length mismatch");
        self.last_values = last_values;
    }

    /// Store raw intrinsic rewards [num_steps][num_envs]
    pub fn set_int_rewards(&mut self, int_rewards: Vec<Vec<f32>>) {
        assert_eq!(int_rewards.len(), self.num_steps, "int_rewards step count mismatch");
        assert!(int_rewards.iter().all(|row| row.len() == self.num_envs));
        self.int_rewards = int_rewards;
    }

    /// Clear computed advantages and returns
    pub fn reset(&mut self) {
        for row in self.advantages.iter_mut().chain(self.returns.iter_mut()) {
            row.fill(0.0);
        }
    }

    /// Get buffer shape (num_steps, num_envs, obs_dim)
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.num_steps, self.num_envs, self.obs_dim)
    }

    /// Get total number of transitions in buffer
    pub fn len(&self) -> usize {
        self.num_steps * self.num_envs
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of episode ends recorded in the segment
    pub fn num_dones(&self) -> usize {
        self.dones.iter().flatten().filter(|&&d| d).count()
    }

    // Getters for raw data access
    pub fn observations(&self) -> &[Vec<Vec<f32>>] { &self.observations }
    pub fn next_observations(&self) -> &[Vec<Vec<f32>>] { &self.next_observations }
    pub fn actions(&self) -> &[Vec<i64>] { &self.actions }
    pub fn ext_rewards(&self) -> &[Vec<f32>] { &self.ext_rewards }
    pub fn int_rewards(&self) -> &[Vec<f32>] { &self.int_rewards }
    pub fn values(&self) -> &[Vec<f32>] { &self.values }
    pub fn log_probs(&self) -> &[Vec<f32>] { &self.log_probs }
    pub fn dones(&self) -> &[Vec<bool>] { &self.dones }
    pub fn last_values(&self) -> &[f32] { &self.last_values }
    pub fn advantages(&self) -> &[Vec<f32>] { &self.advantages }
    pub fn returns(&self) -> &[Vec<f32>] { &self.returns }

    pub fn advantages_mut(&mut self) -> &mut [Vec<f32>] { &mut self.advantages }

    /// Get mutable references to both advantages and returns
    pub fn advantages_and_returns_mut(&mut self) -> (&mut [Vec<f32>], &mut [Vec<f32>]) {
        (&mut self.advantages, &mut self.returns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition<'a>(obs: &'a [f32], next: &'a [f32], done: bool) -> Transition<'a> {
        Transition {
            observation: obs,
            next_observation: next,
            action: 1,
            ext_reward: 1.5,
            value: 0.8,
            log_prob: -0.2,
            done,
        }
    }

    #[test]
    fn test_rollout_buffer_creation() {
        let buffer = RolloutBuffer::new(10, 2, 4);

        assert_eq!(buffer.shape(), (10, 2, 4));
        assert_eq!(buffer.len(), 20);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_rollout_buffer_add_and_reset() {
        let mut buffer = RolloutBuffer::new(5, 1, 2);

        buffer.add(0, 0, transition(&[1.0, 2.0], &[2.0, 3.0], false));
        buffer.add(1, 0, transition(&[2.0, 3.0], &[9.0, 9.0], true));

        assert_eq!(buffer.actions()[0][0], 1);
        assert_eq!(buffer.ext_rewards()[0][0], 1.5);
        assert_eq!(buffer.observations()[0][0], vec![1.0, 2.0]);
        assert_eq!(buffer.next_observations()[1][0], vec![9.0, 9.0]);
        assert!(buffer.dones()[1][0]);
        assert_eq!(buffer.num_dones(), 1);

        buffer.advantages_mut()[0][0] = 3.0;
        buffer.reset();
        assert_eq!(buffer.advantages()[0][0], 0.0);
        assert_eq!(buffer.returns()[0][0], 0.0);
    }

    #[test]
    #[should_panic(expected = "observation dimension mismatch")]
    fn test_rollout_buffer_rejects_wrong_obs_dim() {
        let mut buffer = RolloutBuffer::new(2, 1, 3);
        buffer.add(0, 0, transition(&[1.0], &[1.0], false));
    }

    #[test]
    #[should_panic(expected = "last_values length mismatch")]
    fn test_rollout_buffer_rejects_wrong_last_values() {
        let mut buffer = RolloutBuffer::new(2, 2, 1);
        buffer.set_last_values(vec![0.0]);
    }
}
