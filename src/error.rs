//! Error taxonomy for the training core.
//!
//! One focused enum per concern. Configuration problems are detected
//! before any rollout; capacity and degenerate-batch conditions are
//! invariant violations in the driver's bookkeeping and carry enough
//! context to identify the offending field and shape.

use thiserror::Error;

/// Errors detected while validating a [`TrainConfig`](crate::config::TrainConfig).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("`use_recurrent_policy` and `use_naive_recurrent_policy` are mutually exclusive")]
    RecurrentModeConflict,

    #[error("episode length {episode_length} is not divisible by data chunk length {data_chunk_length}")]
    ChunkLengthMismatch {
        episode_length: usize,
        data_chunk_length: usize,
    },

    #[error("{samples} samples cannot be split into {num_mini_batch} minibatches")]
    TooFewSamples {
        samples: usize,
        num_mini_batch: usize,
    },

    #[error("`{field}` must be positive")]
    NonPositive { field: &'static str },

    #[error("`{field}` = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
}

/// Errors raised by [`RolloutBuffer`](crate::storage::RolloutBuffer) operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BufferError {
    #[error("insert called {attempted} times on a buffer of {capacity} steps without rotation")]
    CapacityExceeded { capacity: usize, attempted: usize },

    #[error("rollout is incomplete: {inserted} of {expected} steps inserted")]
    IncompleteRollout { inserted: usize, expected: usize },

    #[error("field `{field}` has {got} elements, expected {expected}")]
    ShapeMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("step index {step} is out of bounds for episode length {episode_length}")]
    StepOutOfBounds { step: usize, episode_length: usize },
}

/// Errors raised at the action-space boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpaceError {
    #[error("action space `{space}` is not supported by {operation}")]
    UnsupportedActionSpace {
        space: String,
        operation: &'static str,
    },
}

/// Errors surfaced by a training update.
#[derive(Debug, Error)]
pub enum TrainError {
    /// The active-mask sum over a batch is zero; a masked mean would be NaN.
    #[error("degenerate batch: active-mask sum is zero in {context}")]
    DegenerateBatch { context: &'static str },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Space(#[from] SpaceError),

    #[cfg(feature = "nn")]
    #[error("tensor operation failed: {0}")]
    Tch(#[from] tch::TchError),
}

/// Fatal failure reported by the environment collaborator.
///
/// The core has no retry logic: a crashed worker aborts the run.
#[derive(Debug, Error)]
#[error("environment failure: {0}")]
pub struct EnvError(pub String);

/// Errors raised while saving or loading a checkpoint.
#[cfg(feature = "nn")]
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint metadata is invalid: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("weight store failed: {0}")]
    Weights(#[from] tch::TchError),

    #[error("checkpoint schema version {found} does not match expected {expected}")]
    SchemaVersionMismatch { found: u32, expected: u32 },
}

/// Errors raised by the training driver.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Train(#[from] TrainError),

    #[error(transparent)]
    Space(#[from] SpaceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
