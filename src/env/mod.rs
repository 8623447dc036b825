//! Environment traits and implementations
//!
//! This module defines the environment interface consumed by the rollout
//! collector and provides a few built-in environments. Concrete simulators
//! (Atari, MiniGrid, Unity, ...) plug in by implementing [`Environment`].

use anyhow::Result;

/// Core trait for RL environments
///
/// Observations are flat `f32` vectors of a fixed length and actions are
/// discrete indices. Environments must be `Send` so the pool can step them
/// from worker threads.
pub trait Environment: Send {
    /// Reset the environment and return the initial observation
    fn reset(&mut self) -> Result<Vec<f32>>;

    /// Step the environment with an action
    fn step(&mut self, action: i64) -> Result<StepResult>;

    /// Get the observation space dimensions
    fn observation_space(&self) -> SpaceInfo;

    /// Get the action space dimensions
    fn action_space(&self) -> SpaceInfo;

    /// Release any resources held by the environment
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn reset(&mut self) -> Result<Vec<f32>> {
        (**self).reset()
    }

    fn step(&mut self, action: i64) -> Result<StepResult> {
        (**self).step(action)
    }

    fn observation_space(&self) -> SpaceInfo {
        (**self).observation_space()
    }

    fn action_space(&self) -> SpaceInfo {
        (**self).action_space()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Result of an environment step
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Next observation
    pub observation: Vec<f32>,

    /// Reward received
    pub reward: f32,

    /// Whether the episode terminated
    pub terminated: bool,

    /// Whether the episode was truncated
    pub truncated: bool,

    /// Additional info
    pub info: StepInfo,
}

impl StepResult {
    /// Whether the episode ended, for either reason
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Space information for observations and actions
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceInfo {
    /// Shape of the space
    pub shape: Vec<usize>,

    /// Data type
    pub dtype: SpaceType,
}

impl SpaceInfo {
    /// Flat vector observation space of the given length
    pub fn vector(len: usize) -> Self {
        Self { shape: vec![len], dtype: SpaceType::Continuous }
    }

    /// Discrete action space with `n` options
    pub fn discrete(n: usize) -> Self {
        Self { shape: Vec::new(), dtype: SpaceType::Discrete(n) }
    }

    /// Total number of scalar elements
    pub fn flat_dim(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Space data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceType {
    /// Discrete space with n options
    Discrete(usize),

    /// Continuous space (Box)
    Continuous,

    /// Multi-discrete space
    MultiDiscrete,
}

/// Additional step information
#[derive(Debug, Clone, Default)]
pub struct StepInfo {
    /// Observation at the moment the episode ended. Filled in by the pool
    /// when it auto-resets an environment.
    pub terminal_observation: Option<Vec<f32>>,

    /// Summary of the finished episode, if this step ended one
    pub episode: Option<EpisodeInfo>,

    /// Fraction of the state space visited so far, when the environment is
    /// wrapped in [`wrappers::StateCoverage`]
    pub coverage: Option<f32>,
}

/// Return and length of a completed episode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeInfo {
    /// Undiscounted sum of extrinsic rewards
    pub reward: f32,

    /// Number of steps in the episode
    pub length: usize,
}

pub mod countdown;
pub mod gridworld;
pub mod pool;
pub mod wrappers;
