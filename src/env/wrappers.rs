//! Environment wrappers
//!
//! Stochasticity injectors used to stress exploration behaviour:
//! [`NoisyObservation`] appends a "noisy TV" of random values to every
//! observation, [`RandomAction`] replaces the chosen action with a uniformly
//! random one with a fixed probability. [`StateCoverage`] measures how much
//! of a grid an agent has visited.

use std::collections::HashSet;

use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::env::{Environment, SpaceInfo, SpaceType, StepResult};

/// Appends `noise_dims` uniform values in `[-1, 1]` to each observation
pub struct NoisyObservation<E> {
    inner: E,
    noise_dims: usize,
    rng: StdRng,
}

impl<E: Environment> NoisyObservation<E> {
    /// Wrap `inner`, appending `noise_dims` random values per observation
    pub fn new(inner: E, noise_dims: usize, seed: u64) -> Self {
        Self { inner, noise_dims, rng: StdRng::seed_from_u64(seed) }
    }

    fn add_noise(&mut self, mut obs: Vec<f32>) -> Vec<f32> {
        obs.extend((0..self.noise_dims).map(|_| self.rng.gen_range(-1.0..=1.0)));
        obs
    }
}

impl<E: Environment> Environment for NoisyObservation<E> {
    fn reset(&mut self) -> Result<Vec<f32>> {
        let obs = self.inner.reset()?;
        Ok(self.add_noise(obs))
    }

    fn step(&mut self, action: i64) -> Result<StepResult> {
        let mut result = self.inner.step(action)?;
        let obs = std::mem::take(&mut result.observation);
        result.observation = self.add_noise(obs);
        Ok(result)
    }

    fn observation_space(&self) -> SpaceInfo {
        SpaceInfo::vector(self.inner.observation_space().flat_dim() + self.noise_dims)
    }

    fn action_space(&self) -> SpaceInfo {
        self.inner.action_space()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Replaces the agent's action with a random one with probability `prob`
pub struct RandomAction<E> {
    inner: E,
    prob: f64,
    num_actions: usize,
    rng: StdRng,
}

impl<E: Environment> RandomAction<E> {
    /// Wrap `inner`. Only discrete action spaces are supported.
    pub fn new(inner: E, prob: f64, seed: u64) -> Result<Self> {
        let num_actions = match inner.action_space().dtype {
            SpaceType::Discrete(n) => n,
            other => anyhow::bail!("RandomAction needs a discrete action space, got {other:?}"),
        };
        Ok(Self {
            inner,
            prob: prob.clamp(0.0, 1.0),
            num_actions,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl<E: Environment> Environment for RandomAction<E> {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.inner.reset()
    }

    fn step(&mut self, action: i64) -> Result<StepResult> {
        let action = if self.rng.gen_bool(self.prob) {
            self.rng.gen_range(0..self.num_actions) as i64
        } else {
            action
        };
        self.inner.step(action)
    }

    fn observation_space(&self) -> SpaceInfo {
        self.inner.observation_space()
    }

    fn action_space(&self) -> SpaceInfo {
        self.inner.action_space()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Environments whose agent occupies a cell of a discrete grid
pub trait GridPosition {
    /// Current `(row, col)` of the agent
    fn position(&self) -> (usize, usize);

    /// Number of cells the agent can occupy
    fn num_cells(&self) -> usize;
}

/// Counts distinct cells visited over the wrapper's lifetime and reports
/// the visited fraction in [`StepInfo::coverage`](crate::env::StepInfo)
pub struct StateCoverage<E> {
    inner: E,
    visited: HashSet<(usize, usize)>,
}

impl<E: Environment + GridPosition> StateCoverage<E> {
    pub fn new(inner: E) -> Self {
        Self { inner, visited: HashSet::new() }
    }

    /// Visited cells over reachable cells
    pub fn coverage(&self) -> f32 {
        self.visited.len() as f32 / self.inner.num_cells().max(1) as f32
    }

    pub fn num_visited(&self) -> usize {
        self.visited.len()
    }
}

impl<E: Environment + GridPosition> Environment for StateCoverage<E> {
    fn reset(&mut self) -> Result<Vec<f32>> {
        let obs = self.inner.reset()?;
        self.visited.insert(self.inner.position());
        Ok(obs)
    }

    fn step(&mut self, action: i64) -> Result<StepResult> {
        let mut result = self.inner.step(action)?;
        self.visited.insert(self.inner.position());
        result.info.coverage = Some(self.coverage());
        Ok(result)
    }

    fn observation_space(&self) -> SpaceInfo {
        self.inner.observation_space()
    }

    fn action_space(&self) -> SpaceInfo {
        self.inner.action_space()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
