//! Minibatch partitioning and tensor staging for the update epochs
//!
//! A segment is flattened step-major once per update into [`SegmentTensors`];
//! each epoch draws a fresh permutation and splits it into disjoint
//! minibatches that together cover the whole segment.

use anyhow::Result;
use rand::Rng;
use rand::seq::SliceRandom;
use tch::{Device, Kind, Tensor};

use super::storage::RolloutBuffer;

/// Generate minibatch indices for one PPO epoch
///
/// Shuffles `0..buffer_size` and splits it into exactly `n_minibatches`
/// disjoint groups whose sizes differ by at most one.
///
/// # Arguments
/// * `buffer_size` - Total number of samples in the segment
/// * `n_minibatches` - Number of minibatches to produce
/// * `rng` - Source of the permutation
///
/// # Panics
/// Panics if `n_minibatches` is zero or larger than `buffer_size`.
pub fn generate_minibatch_indices<R: Rng + ?Sized>(
    buffer_size: usize,
    n_minibatches: usize,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    assert!(n_minibatches > 0, "n_minibatches must be positive");
    assert!(
        n_minibatches <= buffer_size,
        "cannot split {} samples into {} minibatches",
        buffer_size,
        n_minibatches
    );

    let mut indices: Vec<usize> = (0..buffer_size).collect();
    indices.shuffle(rng);

    let base = buffer_size / n_minibatches;
    let extra = buffer_size % n_minibatches;

    let mut batches = Vec::with_capacity(n_minibatches);
    let mut start = 0;
    for i in 0..n_minibatches {
        let len = base + usize::from(i < extra);
        batches.push(indices[start..start + len].to_vec());
        start += len;
    }
    batches
}

/// A flattened segment staged on the training device
///
/// Row `step * num_envs + env` holds one transition.
#[derive(Debug)]
pub struct SegmentTensors {
    /// Observations [N, obs_dim]
    pub observations: Tensor,

    /// Observations the steps led to [N, obs_dim]
    pub next_observations: Tensor,

    /// Actions [N] (Int64)
    pub actions: Tensor,

    /// Log probabilities under the collecting policy [N]
    pub old_log_probs: Tensor,

    /// Value estimates under the collecting policy [N]
    pub old_values: Tensor,

    /// Advantages [N]
    pub advantages: Tensor,

    /// Value targets [N]
    pub returns: Tensor,
}

impl SegmentTensors {
    /// Flatten a segment and move it to `device`
    ///
    /// `observations`/`next_observations` are taken as given so the caller can
    /// pass normalized copies.
    pub fn from_buffer(
        buffer: &RolloutBuffer,
        observations: &[Vec<Vec<f32>>],
        next_observations: &[Vec<Vec<f32>>],
        device: Device,
    ) -> Result<Self> {
        let (_, _, obs_dim) = buffer.shape();
        let n = buffer.len() as i64;

        let flat_obs: Vec<f32> = observations.iter().flatten().flatten().copied().collect();
        let flat_next: Vec<f32> = next_observations.iter().flatten().flatten().copied().collect();
        anyhow::ensure!(
            flat_obs.len() == buffer.len() * obs_dim && flat_next.len() == flat_obs.len(),
            "segment observations have {} values, expected {}",
            flat_obs.len(),
            buffer.len() * obs_dim
        );

        let flat = |rows: &[Vec<f32>]| -> Tensor {
            let v: Vec<f32> = rows.iter().flatten().copied().collect();
            Tensor::from_slice(&v).to_device(device)
        };
        let actions: Vec<i64> = buffer.actions().iter().flatten().copied().collect();

        Ok(Self {
            observations: Tensor::from_slice(&flat_obs).view([n, obs_dim as i64]).to_device(device),
            next_observations: Tensor::from_slice(&flat_next)
                .view([n, obs_dim as i64])
                .to_device(device),
            actions: Tensor::from_slice(&actions).to_device(device),
            old_log_probs: flat(buffer.log_probs()),
            old_values: flat(buffer.values()),
            advantages: flat(buffer.advantages()),
            returns: flat(buffer.returns()),
        })
    }

    /// Re-stage advantages and returns after they were recomputed in `buffer`
    pub fn refresh_targets(&mut self, buffer: &RolloutBuffer) {
        let device = self.actions.device();
        let flat = |rows: &[Vec<f32>]| -> Tensor {
            let v: Vec<f32> = rows.iter().flatten().copied().collect();
            Tensor::from_slice(&v).to_device(device)
        };
        self.advantages = flat(buffer.advantages());
        self.returns = flat(buffer.returns());
    }

    /// Number of transitions
    pub fn len(&self) -> usize {
        self.actions.size()[0] as usize
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gather the rows named by `indices`
    pub fn select(&self, indices: &[usize]) -> Minibatch {
        let device = self.actions.device();
        let idx: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
        let idx = Tensor::from_slice(&idx).to_device(device);

        Minibatch {
            observations: self.observations.index_select(0, &idx),
            next_observations: self.next_observations.index_select(0, &idx),
            actions: self.actions.index_select(0, &idx),
            old_log_probs: self.old_log_probs.index_select(0, &idx),
            old_values: self.old_values.index_select(0, &idx),
            advantages: self.advantages.index_select(0, &idx),
            returns: self.returns.index_select(0, &idx),
        }
    }
}

/// One minibatch of a staged segment
#[derive(Debug)]
pub struct Minibatch {
    pub observations: Tensor,
    pub next_observations: Tensor,
    pub actions: Tensor,
    pub old_log_probs: Tensor,
    pub old_values: Tensor,
    pub advantages: Tensor,
    pub returns: Tensor,
}

impl Minibatch {
    /// Get batch size
    pub fn size(&self) -> usize {
        self.actions.size()[0] as usize
    }

    /// Mean, std, min and max of the advantages, for error reports
    pub fn advantage_summary(&self) -> String {
        let adv = self.advantages.to_kind(Kind::Float);
        let stat = |t: Tensor| f64::try_from(&t).unwrap_or(f64::NAN);
        format!(
            "advantages mean={:.4} std={:.4} min={:.4} max={:.4} (n={})",
            stat(adv.mean(Kind::Float)),
            stat(adv.std(false)),
            stat(adv.min()),
            stat(adv.max()),
            self.size()
        )
    }
}
