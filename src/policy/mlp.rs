//! Feed-forward actor-critic reference policy.
//!
//! MLP actor over per-agent observations and centralized MLP critic over
//! the joint observation, each with its own variable store and Adam
//! optimizer. Discrete action spaces only; recurrent states pass through
//! unchanged so the policy satisfies the full collaborator contract.

use std::path::Path;

use tch::{nn, nn::Module, nn::OptimizerConfig, Device, Kind, Tensor};

use crate::config::TrainConfig;
use crate::error::{CheckpointError, SpaceError};
use crate::policy::{ActOutput, ActorCriticPolicy, EvalOutput};
use crate::spaces::ActionSpace;

/// Large negative logit offset for unavailable actions.
const MASK_OFFSET: f64 = 1e8;

fn mlp(p: &nn::Path, in_dim: i64, hidden: i64, out_dim: i64) -> nn::Sequential {
    nn::seq()
        .add(nn::linear(p / "l1", in_dim, hidden, Default::default()))
        .add_fn(|x| x.relu())
        .add(nn::linear(p / "l2", hidden, hidden, Default::default()))
        .add_fn(|x| x.relu())
        .add(nn::linear(p / "l3", hidden, out_dim, Default::default()))
}

/// Sum of squared gradient magnitudes over a variable store.
fn grad_norm_sq(vs: &nn::VarStore) -> f64 {
    let mut total = 0.0;
    for (_, tensor) in vs.variables() {
        let grad = tensor.grad();
        if grad.defined() {
            total += f64::try_from((&grad * &grad).sum(Kind::Float)).unwrap_or(0.0);
        }
    }
    total
}

/// Separated actor/critic MLP policy.
pub struct MlpPolicy {
    actor_vs: nn::VarStore,
    critic_vs: nn::VarStore,
    actor: nn::Sequential,
    critic: nn::Sequential,
    actor_opt: nn::Optimizer,
    critic_opt: nn::Optimizer,
    recurrent_dim: usize,
    device: Device,
}

impl MlpPolicy {
    /// Builds the actor and critic networks with their optimizers.
    ///
    /// Only [`ActionSpace::Discrete`] is supported; everything else is a
    /// typed [`SpaceError::UnsupportedActionSpace`].
    pub fn new(
        config: &TrainConfig,
        obs_dim: usize,
        share_obs_dim: usize,
        action_space: &ActionSpace,
        device: Device,
    ) -> Result<Self, SpaceError> {
        let n_actions = match action_space {
            ActionSpace::Discrete { n } => *n as i64,
            other => {
                return Err(SpaceError::UnsupportedActionSpace {
                    space: other.name().to_string(),
                    operation: "MlpPolicy",
                })
            }
        };

        let actor_vs = nn::VarStore::new(device);
        let critic_vs = nn::VarStore::new(device);
        let actor = mlp(
            &actor_vs.root(),
            obs_dim as i64,
            config.hidden_size,
            n_actions,
        );
        let critic = mlp(&critic_vs.root(), share_obs_dim as i64, config.hidden_size, 1);

        let actor_opt = nn::Adam::default()
            .build(&actor_vs, config.lr)
            .expect("failed to build actor optimizer");
        let critic_opt = nn::Adam::default()
            .build(&critic_vs, config.critic_lr)
            .expect("failed to build critic optimizer");

        Ok(Self {
            actor_vs,
            critic_vs,
            actor,
            critic,
            actor_opt,
            critic_opt,
            recurrent_dim: config.hidden_size as usize,
            device,
        })
    }

    /// Log-probabilities over actions, with unavailable actions pushed
    /// far below every available one.
    fn action_log_dist(&self, obs: &Tensor, available_actions: Option<&Tensor>) -> Tensor {
        let logits = self.actor.forward(obs);
        let masked = match available_actions {
            Some(avail) => logits + (avail - 1.0) * MASK_OFFSET,
            None => logits,
        };
        masked.log_softmax(-1, Kind::Float)
    }

    fn gather_log_probs(log_probs: &Tensor, actions: &Tensor) -> Tensor {
        let indices = actions.to_kind(Kind::Int64).reshape([-1, 1]);
        log_probs.gather(-1, &indices, false)
    }
}

impl ActorCriticPolicy for MlpPolicy {
    fn get_actions(
        &self,
        share_obs: &Tensor,
        obs: &Tensor,
        rnn_states: &Tensor,
        rnn_states_critic: &Tensor,
        _masks: &Tensor,
        available_actions: Option<&Tensor>,
        deterministic: bool,
    ) -> ActOutput {
        tch::no_grad(|| {
            let log_probs = self.action_log_dist(obs, available_actions);
            let actions = if deterministic {
                log_probs.argmax(-1, false).unsqueeze(-1)
            } else {
                log_probs.exp().multinomial(1, true)
            };
            let action_log_probs = log_probs.gather(-1, &actions, false);
            let values = self.critic.forward(share_obs);
            ActOutput {
                values,
                actions: actions.to_kind(Kind::Float),
                action_log_probs,
                rnn_states: rnn_states.shallow_clone(),
                rnn_states_critic: rnn_states_critic.shallow_clone(),
            }
        })
    }

    fn get_values(
        &self,
        share_obs: &Tensor,
        _rnn_states_critic: &Tensor,
        _masks: &Tensor,
    ) -> Tensor {
        tch::no_grad(|| self.critic.forward(share_obs))
    }

    fn evaluate_actions(
        &self,
        share_obs: &Tensor,
        obs: &Tensor,
        _rnn_states: &Tensor,
        _rnn_states_critic: &Tensor,
        actions: &Tensor,
        _masks: &Tensor,
        available_actions: Option<&Tensor>,
        active_masks: Option<&Tensor>,
    ) -> EvalOutput {
        let log_probs = self.action_log_dist(obs, available_actions);
        let action_log_probs = Self::gather_log_probs(&log_probs, actions);

        let probs = log_probs.exp();
        let entropy = -(&probs * &log_probs).sum_dim_intlist([-1].as_slice(), false, Kind::Float);
        let dist_entropy = match active_masks {
            Some(active) => {
                let active = active.reshape([-1]);
                (entropy * &active).sum(Kind::Float) / active.sum(Kind::Float)
            }
            None => entropy.mean(Kind::Float),
        };

        let values = self.critic.forward(share_obs);
        EvalOutput {
            values,
            action_log_probs,
            dist_entropy,
        }
    }

    fn get_logprobs(
        &self,
        obs: &Tensor,
        _rnn_states: &Tensor,
        actions: &Tensor,
        _masks: &Tensor,
        available_actions: Option<&Tensor>,
    ) -> Tensor {
        tch::no_grad(|| {
            let log_probs = self.action_log_dist(obs, available_actions);
            Self::gather_log_probs(&log_probs, actions)
        })
    }

    fn actor_backward_step(&mut self, loss: &Tensor, max_grad_norm: Option<f64>) -> f64 {
        self.actor_opt.zero_grad();
        loss.backward();
        let norm = grad_norm_sq(&self.actor_vs).sqrt();
        if let Some(max) = max_grad_norm {
            self.actor_opt.clip_grad_norm(max);
        }
        self.actor_opt.step();
        norm
    }

    fn critic_backward_step(&mut self, loss: &Tensor, max_grad_norm: Option<f64>) -> f64 {
        self.critic_opt.zero_grad();
        loss.backward();
        let norm = grad_norm_sq(&self.critic_vs).sqrt();
        if let Some(max) = max_grad_norm {
            self.critic_opt.clip_grad_norm(max);
        }
        self.critic_opt.step();
        norm
    }

    fn joint_backward_step(&mut self, loss: &Tensor, max_grad_norm: Option<f64>) -> f64 {
        self.actor_opt.zero_grad();
        self.critic_opt.zero_grad();
        loss.backward();
        let norm = (grad_norm_sq(&self.actor_vs) + grad_norm_sq(&self.critic_vs)).sqrt();
        if let Some(max) = max_grad_norm {
            self.actor_opt.clip_grad_norm(max);
            self.critic_opt.clip_grad_norm(max);
        }
        self.actor_opt.step();
        self.critic_opt.step();
        norm
    }

    fn prep_rollout(&mut self) {
        // MLP layers have no mode-dependent behavior; the contract still
        // brackets collection and training for policies that do.
    }

    fn prep_training(&mut self) {}

    fn recurrent_dim(&self) -> usize {
        self.recurrent_dim
    }

    fn device(&self) -> Device {
        self.device
    }

    fn save_weights(&self, dir: &Path) -> Result<(), CheckpointError> {
        self.actor_vs.save(dir.join("actor.ot"))?;
        self.critic_vs.save(dir.join("critic.ot"))?;
        Ok(())
    }

    fn load_weights(&mut self, dir: &Path) -> Result<(), CheckpointError> {
        self.actor_vs.load(dir.join("actor.ot"))?;
        self.critic_vs.load(dir.join("critic.ot"))?;
        Ok(())
    }
}
