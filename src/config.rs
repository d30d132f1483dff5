//! Configuration for rollout collection and training.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Hyperparameters and mode flags shared by the buffer, estimator,
/// generators, and trainers.
///
/// Defaults follow the reference hyperparameters for cooperative
/// multi-agent benchmarks. Call [`TrainConfig::validate`] before
/// constructing a runner; every invalid flag combination is rejected
/// up front, before any rollout is collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    // --- Rollout geometry ---
    /// Number of steps collected per rollout (T).
    pub episode_length: usize,
    /// Number of parallel environment workers (E).
    pub n_rollout_threads: usize,
    /// Number of agents per environment (A).
    pub n_agents: usize,

    // --- Optimization ---
    /// Actor learning rate.
    pub lr: f64,
    /// Critic learning rate.
    pub critic_lr: f64,
    /// Hidden layer width of the reference MLP policy.
    pub hidden_size: i64,
    /// Number of epochs over the buffer per policy-improvement phase.
    pub ppo_epoch: usize,
    /// Number of epochs in the MAPPG auxiliary phase.
    pub aux_epoch: usize,
    /// Number of minibatches per epoch.
    pub num_mini_batch: usize,
    /// Sequence chunk length for the chunked-recurrent generator.
    pub data_chunk_length: usize,
    /// PPO clip parameter ε.
    pub clip_param: f32,
    /// Value loss coefficient.
    pub value_loss_coef: f64,
    /// Entropy bonus coefficient.
    pub entropy_coef: f64,
    /// Behavior-cloning coefficient for the MAPPG auxiliary loss.
    pub clone_coef: f64,
    /// Gradient norm ceiling.
    pub max_grad_norm: f64,
    /// Huber loss transition point δ.
    pub huber_delta: f32,

    // --- Return estimation ---
    /// Discount factor γ.
    pub gamma: f32,
    /// GAE λ parameter.
    pub gae_lambda: f32,
    /// Use GAE instead of plain n-step discounting.
    pub use_gae: bool,
    /// Normalize value targets with PopArt.
    pub use_popart: bool,
    /// Suppress bootstrapping across artificial time-limit truncations.
    pub use_proper_time_limits: bool,

    // --- Mode flags ---
    /// Train with fixed-length sequence chunks (chunked-recurrent generator).
    pub use_recurrent_policy: bool,
    /// Train on full per-environment sequences (naive-recurrent generator).
    pub use_naive_recurrent_policy: bool,
    /// Clip gradient norms to `max_grad_norm` (otherwise only measure them).
    pub use_max_grad_norm: bool,
    /// Clip the value prediction against its rollout-time estimate.
    pub use_clipped_value_loss: bool,
    /// Use Huber instead of squared error for the value loss.
    pub use_huber_loss: bool,
    /// Weight the value loss by active masks.
    pub use_value_active_masks: bool,
    /// Weight the policy loss and advantage statistics by active masks.
    pub use_policy_active_masks: bool,
}

impl TrainConfig {
    /// Checks flag combinations and numeric ranges.
    ///
    /// Fails fast so that misconfiguration never reaches the rollout loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_recurrent_policy && self.use_naive_recurrent_policy {
            return Err(ConfigError::RecurrentModeConflict);
        }
        for (field, value) in [
            ("episode_length", self.episode_length),
            ("n_rollout_threads", self.n_rollout_threads),
            ("n_agents", self.n_agents),
            ("ppo_epoch", self.ppo_epoch),
            ("num_mini_batch", self.num_mini_batch),
        ] {
            if value == 0 {
                return Err(ConfigError::NonPositive { field });
            }
        }
        if self.use_recurrent_policy {
            if self.data_chunk_length == 0 {
                return Err(ConfigError::NonPositive {
                    field: "data_chunk_length",
                });
            }
            if self.episode_length % self.data_chunk_length != 0 {
                return Err(ConfigError::ChunkLengthMismatch {
                    episode_length: self.episode_length,
                    data_chunk_length: self.data_chunk_length,
                });
            }
        }
        for (field, value) in [
            ("gamma", self.gamma),
            ("gae_lambda", self.gae_lambda),
            ("clip_param", self.clip_param),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange {
                    field,
                    value,
                    min: 0.0,
                    max: 1.0,
                });
            }
        }
        Ok(())
    }

    /// Total number of transitions in one full rollout: `T × E × A`.
    pub fn rollout_size(&self) -> usize {
        self.episode_length * self.n_rollout_threads * self.n_agents
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            episode_length: 200,
            n_rollout_threads: 8,
            n_agents: 2,
            lr: 5e-4,
            critic_lr: 5e-4,
            hidden_size: 64,
            ppo_epoch: 15,
            aux_epoch: 5,
            num_mini_batch: 1,
            data_chunk_length: 10,
            clip_param: 0.2,
            value_loss_coef: 1.0,
            entropy_coef: 0.01,
            clone_coef: 1.0,
            max_grad_norm: 10.0,
            huber_delta: 10.0,
            gamma: 0.99,
            gae_lambda: 0.95,
            use_gae: true,
            use_popart: false,
            use_proper_time_limits: false,
            use_recurrent_policy: false,
            use_naive_recurrent_policy: false,
            use_max_grad_norm: true,
            use_clipped_value_loss: true,
            use_huber_loss: true,
            use_value_active_masks: true,
            use_policy_active_masks: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn recurrent_flags_are_exclusive() {
        let cfg = TrainConfig {
            use_recurrent_policy: true,
            use_naive_recurrent_policy: true,
            ..TrainConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::RecurrentModeConflict));
    }

    #[test]
    fn chunk_length_must_divide_episode_length() {
        for (episode_length, data_chunk_length) in [(200, 7), (10, 3), (64, 9)] {
            let cfg = TrainConfig {
                episode_length,
                data_chunk_length,
                use_recurrent_policy: true,
                ..TrainConfig::default()
            };
            assert_eq!(
                cfg.validate(),
                Err(ConfigError::ChunkLengthMismatch {
                    episode_length,
                    data_chunk_length,
                })
            );
        }
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let cfg = TrainConfig {
            n_agents: 0,
            ..TrainConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NonPositive { field: "n_agents" })
        );
    }

    #[test]
    fn gamma_out_of_range_is_rejected() {
        let cfg = TrainConfig {
            gamma: 1.5,
            ..TrainConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "gamma", .. })
        ));
    }

    #[test]
    fn rollout_size_counts_all_transitions() {
        let cfg = TrainConfig {
            episode_length: 5,
            n_rollout_threads: 2,
            n_agents: 3,
            ..TrainConfig::default()
        };
        assert_eq!(cfg.rollout_size(), 30);
    }
}
