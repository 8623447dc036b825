//! Generalized Advantage Estimation (GAE) computation
//!
//! This module implements GAE for computing advantages from trajectories.
//! GAE helps reduce variance in policy gradient methods while maintaining
//! sufficient bias for learning.

use super::storage::RolloutBuffer;

/// Compute Generalized Advantage Estimation (GAE)
///
/// GAE computes advantages using a weighted sum of n-step returns,
/// providing a balance between bias and variance.
///
/// # Arguments
/// * `buffer` - Rollout buffer holding values, dones and bootstrap values
/// * `rewards` - Combined rewards to estimate advantages for [num_steps][num_envs]
/// * `gamma` - Discount factor (0 <= gamma <= 1)
/// * `gae_lambda` - GAE lambda parameter (0 <= lambda <= 1)
/// * `use_news` - Whether episode ends cut value bootstrapping and propagation
///
/// # Mathematical Formula
/// ```text
/// m_t = use_news ? 1 - done_t : 1
/// δ_t = r_t + γ * V_{t+1} * m_t - V_t
/// A_t = δ_t + γ * λ * m_t * A_{t+1}
/// ```
///
/// `V_T` is the bootstrap value stored with the segment. Returns are `A + V`.
pub fn compute_advantages(
    buffer: &mut RolloutBuffer,
    rewards: &[Vec<f32>],
    gamma: f32,
    gae_lambda: f32,
    use_news: bool,
) {
    let (num_steps, num_envs, _) = buffer.shape();
    debug_assert_eq!(rewards.len(), num_steps, "rewards step count mismatch");

    let mut adv_columns = Vec::with_capacity(num_envs);
    let mut ret_columns = Vec::with_capacity(num_envs);

    for env_id in 0..num_envs {
        let env_rewards: Vec<f32> = rewards.iter().map(|step| step[env_id]).collect();
        let env_values: Vec<f32> = buffer.values().iter().map(|step| step[env_id]).collect();
        let env_dones: Vec<bool> = buffer.dones().iter().map(|step| step[env_id]).collect();

        let mut env_advantages = vec![0.0; num_steps];
        let mut env_returns = vec![0.0; num_steps];

        compute_gae_single_env(
            &env_rewards,
            &env_values,
            &env_dones,
            buffer.last_values()[env_id],
            GaeParams { gamma, gae_lambda, use_news },
            &mut env_advantages,
            &mut env_returns,
        );

        adv_columns.push(env_advantages);
        ret_columns.push(env_returns);
    }

    let (advantages, returns) = buffer.advantages_and_returns_mut();
    for (env_id, (adv, ret)) in adv_columns.iter().zip(&ret_columns).enumerate() {
        for step in 0..num_steps {
            advantages[step][env_id] = adv[step];
            returns[step][env_id] = ret[step];
        }
    }
}

/// Discounting parameters for a GAE pass
#[derive(Debug, Clone, Copy)]
pub(crate) struct GaeParams {
    pub gamma: f32,
    pub gae_lambda: f32,
    pub use_news: bool,
}

/// Compute GAE for a single environment
///
/// Processes one environment's column backward through the segment.
pub(crate) fn compute_gae_single_env(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    last_value: f32,
    params: GaeParams,
    advantages: &mut [f32],
    returns: &mut [f32],
) {
    let num_steps = rewards.len();
    debug_assert_eq!(values.len(), num_steps);
    debug_assert_eq!(dones.len(), num_steps);
    debug_assert_eq!(advantages.len(), num_steps);
    debug_assert_eq!(returns.len(), num_steps);

    let GaeParams { gamma, gae_lambda, use_news } = params;
    let mut lastgaelam = 0.0;

    for t in (0..num_steps).rev() {
        let next_value = if t + 1 == num_steps { last_value } else { values[t + 1] };
        let mask = if use_news && dones[t] { 0.0 } else { 1.0 };

        let delta = rewards[t] + gamma * next_value * mask - values[t];
        lastgaelam = delta + gamma * gae_lambda * mask * lastgaelam;

        advantages[t] = lastgaelam;
        returns[t] = lastgaelam + values[t];
    }
}

/// Summary statistics of the advantages currently held by the buffer
///
/// Returns `(mean, std, min, max)`; std is the population standard deviation.
pub fn advantage_stats(buffer: &RolloutBuffer) -> (f32, f32, f32, f32) {
    let flat: Vec<f32> = buffer.advantages().iter().flatten().copied().collect();
    if flat.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let n = flat.len() as f32;
    let mean = flat.iter().sum::<f32>() / n;
    let var = flat.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / n;
    let min = flat.iter().copied().fold(f32::INFINITY, f32::min);
    let max = flat.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    (mean, var.sqrt(), min, max)
}

/// Normalize advantages across the entire segment
///
/// Zero mean, unit standard deviation; `1e-7` guards the division.
///
/// # Arguments
/// * `buffer` - Rollout buffer with computed advantages
pub fn normalize_advantages(buffer: &mut RolloutBuffer) {
    let (mean, std, _, _) = advantage_stats(buffer);
    let std = std + 1e-7;

    for row in buffer.advantages_mut() {
        for adv in row.iter_mut() {
            *adv = (*adv - mean) / std;
        }
    }
}
