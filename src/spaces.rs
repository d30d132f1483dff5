//! Action space model.
//!
//! A closed set of action space variants, each with an explicit flat
//! storage width. Consumers that only handle a subset (the reference MLP
//! policy is discrete-only) reject the rest with a typed error rather
//! than a generic fallthrough.

use serde::{Deserialize, Serialize};

use crate::error::SpaceError;

/// The action space of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionSpace {
    /// A single categorical action with `n` choices.
    Discrete { n: usize },
    /// Several independent categorical actions.
    MultiDiscrete { nvec: Vec<usize> },
    /// A continuous action vector.
    Continuous { dim: usize },
}

impl ActionSpace {
    /// Width of one stored action row in the buffer.
    pub fn flat_dim(&self) -> usize {
        match self {
            ActionSpace::Discrete { .. } => 1,
            ActionSpace::MultiDiscrete { nvec } => nvec.len(),
            ActionSpace::Continuous { dim } => *dim,
        }
    }

    /// Width of the legal-action mask row, or 0 when the space has none.
    pub fn available_actions_dim(&self) -> usize {
        match self {
            ActionSpace::Discrete { n } => *n,
            _ => 0,
        }
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ActionSpace::Discrete { .. } => "Discrete",
            ActionSpace::MultiDiscrete { .. } => "MultiDiscrete",
            ActionSpace::Continuous { .. } => "Continuous",
        }
    }

    /// Converts one stored flat action row into discrete indices for the
    /// environment.
    ///
    /// Continuous rows have no index form; asking for one is an
    /// [`SpaceError::UnsupportedActionSpace`].
    pub fn to_env_indices(&self, row: &[f32]) -> Result<Vec<i64>, SpaceError> {
        match self {
            ActionSpace::Discrete { .. } | ActionSpace::MultiDiscrete { .. } => {
                Ok(row.iter().map(|&a| a as i64).collect())
            }
            ActionSpace::Continuous { .. } => Err(SpaceError::UnsupportedActionSpace {
                space: self.name().to_string(),
                operation: "discrete index conversion",
            }),
        }
    }
}
