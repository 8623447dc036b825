//! Policy and neural network wrappers
//!
//! This module provides policy implementations using tch-rs for neural
//! networks.

pub mod mlp;

pub use mlp::{Activation, MlpConfig, MlpPolicy};
