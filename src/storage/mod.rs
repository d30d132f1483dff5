//! Rollout storage: buffer, return estimation, and minibatch generation.

pub mod buffer;
pub mod gae;
pub mod generator;

pub use buffer::{RolloutBuffer, StepRecord, TurnRecord};
pub use generator::MiniBatch;
