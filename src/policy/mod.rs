//! Policy collaborator boundary.
//!
//! The training core composes with any policy that exposes the
//! act/evaluate/value contract below. Collection-time methods run under
//! `no_grad`; `evaluate_actions` is the differentiable path used by the
//! trainers. Recurrent-state tensors are opaque to the core: a
//! feed-forward policy passes them through unchanged.

pub mod mlp;

use std::path::Path;

use tch::{Device, Tensor};

use crate::error::CheckpointError;

/// Output of a collection-time action query.
#[derive(Debug)]
pub struct ActOutput {
    /// State-value estimates, `[batch, 1]`.
    pub values: Tensor,
    /// Chosen actions in flat storage form, `[batch, act_dim]`.
    pub actions: Tensor,
    /// Log-probabilities of the chosen actions, `[batch, 1]`.
    pub action_log_probs: Tensor,
    /// Updated actor recurrent states, `[batch, recurrent_dim]`.
    pub rnn_states: Tensor,
    /// Updated critic recurrent states, `[batch, recurrent_dim]`.
    pub rnn_states_critic: Tensor,
}

/// Output of a training-time evaluation of stored actions.
#[derive(Debug)]
pub struct EvalOutput {
    /// State-value estimates, `[batch, 1]`.
    pub values: Tensor,
    /// Log-probabilities of the stored actions, `[batch, 1]`.
    pub action_log_probs: Tensor,
    /// Scalar distribution entropy, active-mask weighted when masks are
    /// provided.
    pub dist_entropy: Tensor,
}

/// The act/evaluate/value contract consumed by the trainers and driver.
#[allow(clippy::too_many_arguments)]
pub trait ActorCriticPolicy {
    /// Samples (or argmaxes, when `deterministic`) actions for one
    /// collection step. Runs without gradients.
    fn get_actions(
        &self,
        share_obs: &Tensor,
        obs: &Tensor,
        rnn_states: &Tensor,
        rnn_states_critic: &Tensor,
        masks: &Tensor,
        available_actions: Option<&Tensor>,
        deterministic: bool,
    ) -> ActOutput;

    /// Critic values for bootstrap computation. Runs without gradients.
    fn get_values(&self, share_obs: &Tensor, rnn_states_critic: &Tensor, masks: &Tensor)
        -> Tensor;

    /// Differentiable log-probs, entropy, and values for stored actions.
    fn evaluate_actions(
        &self,
        share_obs: &Tensor,
        obs: &Tensor,
        rnn_states: &Tensor,
        rnn_states_critic: &Tensor,
        actions: &Tensor,
        masks: &Tensor,
        available_actions: Option<&Tensor>,
        active_masks: Option<&Tensor>,
    ) -> EvalOutput;

    /// Log-probabilities of stored actions under the current policy,
    /// without gradients. Used by the MAPPG auxiliary refresh.
    fn get_logprobs(
        &self,
        obs: &Tensor,
        rnn_states: &Tensor,
        actions: &Tensor,
        masks: &Tensor,
        available_actions: Option<&Tensor>,
    ) -> Tensor;

    /// Zero-grad, backward, clip (or only measure) the gradient norm,
    /// and step the actor optimizer. Returns the pre-clip norm.
    fn actor_backward_step(&mut self, loss: &Tensor, max_grad_norm: Option<f64>) -> f64;

    /// As [`ActorCriticPolicy::actor_backward_step`], for the critic.
    fn critic_backward_step(&mut self, loss: &Tensor, max_grad_norm: Option<f64>) -> f64;

    /// One backward pass driving both optimizers, for joint objectives.
    fn joint_backward_step(&mut self, loss: &Tensor, max_grad_norm: Option<f64>) -> f64;

    /// Switches the policy to collection mode.
    fn prep_rollout(&mut self);

    /// Switches the policy to training mode.
    fn prep_training(&mut self);

    /// Flattened width of one recurrent-state row.
    fn recurrent_dim(&self) -> usize;

    /// Device the policy's tensors live on.
    fn device(&self) -> Device;

    /// Writes weight files under `dir`.
    fn save_weights(&self, dir: &Path) -> Result<(), CheckpointError>;

    /// Restores weight files from `dir`.
    fn load_weights(&mut self, dir: &Path) -> Result<(), CheckpointError>;
}

pub use mlp::MlpPolicy;
