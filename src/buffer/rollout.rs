//! Rollout buffer for storing and processing trajectory segments
//!
//! This module implements experience storage for PPO training, including:
//! - Segment storage (observations, actions, rewards, etc.)
//! - Segment collection from an environment pool
//! - GAE (Generalized Advantage Estimation) computation
//! - Minibatch partitioning for the update epochs
//!
//! # Buffer Layout
//!
//! The buffer uses a `[num_steps, num_envs]` layout where:
//! - `num_steps`: Number of timesteps per segment (typically 128)
//! - `num_envs`: Number of parallel environments
//!
//! Flattened batches are step-major: index `step * num_envs + env`.

pub mod collector;
pub mod gae;
pub mod sampling;
pub mod storage;


pub use collector::{ActOutput, EpisodeStats, SegmentCollector, SegmentPolicy};
pub use gae::{compute_advantages, normalize_advantages};
pub use sampling::{SegmentTensors, generate_minibatch_indices};
pub use storage::{RolloutBuffer, Transition};
