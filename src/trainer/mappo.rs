//! Clipped-surrogate policy optimization over shared-critic rollouts.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::TrainConfig;
use crate::error::{ConfigError, TrainError};
use crate::normalizer::PopArt;
use crate::policy::ActorCriticPolicy;
use crate::storage::RolloutBuffer;
use crate::trainer::{
    generate_batches, masked_mean, normalized_advantages, value_loss, BatchTensors, TrainStats,
};

/// One PPO-style learner: `ppo_epoch` passes over the rollout, each
/// pass a fresh shuffle into `num_mini_batch` batches, with separate
/// actor and critic optimizer steps per batch.
pub struct MappoTrainer<P: ActorCriticPolicy> {
    policy: P,
    config: TrainConfig,
    value_normalizer: Option<PopArt>,
    rng: StdRng,
}

impl<P: ActorCriticPolicy> MappoTrainer<P> {
    pub fn new(config: &TrainConfig, policy: P, seed: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(MappoTrainer {
            policy,
            config: config.clone(),
            value_normalizer: config.use_popart.then(PopArt::default),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn value_normalizer(&self) -> Option<&PopArt> {
        self.value_normalizer.as_ref()
    }

    /// Runs the full update schedule against a completed rollout and
    /// returns averaged statistics.
    pub fn train(&mut self, buffer: &mut RolloutBuffer) -> Result<TrainStats, TrainError> {
        let advantages = normalized_advantages(
            buffer,
            self.value_normalizer.as_ref(),
            self.config.use_policy_active_masks,
        )?;

        let mut stats = TrainStats::default();
        for _ in 0..self.config.ppo_epoch {
            let batches = generate_batches(buffer, &advantages, &self.config, &mut self.rng)?;
            for batch in &batches {
                if let Some(norm) = self.value_normalizer.as_mut() {
                    norm.update(&batch.returns);
                }
                let tensors =
                    BatchTensors::new(batch, self.value_normalizer.as_ref(), self.policy.device());
                self.update(&tensors, &mut stats)?;
            }
        }
        stats.finalize(self.config.ppo_epoch * self.config.num_mini_batch, 0);
        Ok(stats)
    }

    fn update(&mut self, batch: &BatchTensors, stats: &mut TrainStats) -> Result<(), TrainError> {
        let masked = self.config.use_policy_active_masks || self.config.use_value_active_masks;
        if masked && batch.active_sum() == 0.0 {
            return Err(TrainError::DegenerateBatch {
                context: "minibatch update",
            });
        }

        let eval = self.policy.evaluate_actions(
            &batch.share_obs,
            &batch.obs,
            &batch.rnn_states,
            &batch.rnn_states_critic,
            &batch.actions,
            &batch.masks,
            batch.available_actions.as_ref(),
            self.config
                .use_policy_active_masks
                .then_some(&batch.active_masks),
        );

        let clip = f64::from(self.config.clip_param);
        let ratio = (&eval.action_log_probs - &batch.old_action_log_probs).exp();
        let surr1 = &ratio * &batch.advantages;
        let surr2 = ratio.clamp(1.0 - clip, 1.0 + clip) * &batch.advantages;
        let surrogate = surr1.min_other(&surr2);
        let action_loss = if self.config.use_policy_active_masks {
            -masked_mean(&surrogate, &batch.active_masks)
        } else {
            -surrogate.mean(tch::Kind::Float)
        };

        let actor_objective =
            &action_loss - &eval.dist_entropy * f64::from(self.config.entropy_coef);
        let max_norm = self
            .config
            .use_max_grad_norm
            .then_some(f64::from(self.config.max_grad_norm));
        let actor_grad_norm = self.policy.actor_backward_step(&actor_objective, max_norm);

        let v_loss = value_loss(
            &self.config,
            &eval.values,
            &batch.value_preds,
            &batch.returns,
            &batch.active_masks,
        );
        let critic_objective = &v_loss * f64::from(self.config.value_loss_coef);
        let critic_grad_norm = self.policy.critic_backward_step(&critic_objective, max_norm);

        stats.value_loss += f64::try_from(v_loss)?;
        stats.action_loss += f64::try_from(action_loss)?;
        stats.dist_entropy += f64::try_from(eval.dist_entropy)?;
        stats.actor_grad_norm += actor_grad_norm;
        stats.critic_grad_norm += critic_grad_norm;
        stats.ratio += f64::try_from(ratio.mean(tch::Kind::Float))?;
        Ok(())
    }
}
