//! Utility functions and helpers

pub mod normalize;
pub mod seeding;
