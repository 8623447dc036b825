//! Experience storage for on-policy training

pub mod rollout;
