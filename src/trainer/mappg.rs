//! Phasic policy-gradient variant: a clipped-surrogate policy phase
//! followed by an auxiliary phase that trains the value head while
//! cloning the behavior policy through a KL penalty.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::Tensor;

use crate::config::TrainConfig;
use crate::error::{ConfigError, TrainError};
use crate::normalizer::PopArt;
use crate::policy::ActorCriticPolicy;
use crate::storage::RolloutBuffer;
use crate::trainer::{
    generate_batches, masked_mean, normalized_advantages, value_loss, BatchTensors, TrainStats,
};

/// MAPPG learner.
///
/// Between the two phases the stored log-probs are refreshed under the
/// current policy, so the auxiliary KL anchors to the post-policy-phase
/// distribution rather than the collection-time one.
pub struct MappgTrainer<P: ActorCriticPolicy> {
    policy: P,
    config: TrainConfig,
    value_normalizer: Option<PopArt>,
    rng: StdRng,
}

impl<P: ActorCriticPolicy> MappgTrainer<P> {
    pub fn new(config: &TrainConfig, policy: P, seed: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(MappgTrainer {
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
                self.policy_update(&tensors, &mut stats)?;
                self.value_update(&tensors, &mut stats)?;
            }
        }

        self.refresh_action_log_probs(buffer)?;

        for _ in 0..self.config.aux_epoch {
            let batches = generate_batches(buffer, &advantages, &self.config, &mut self.rng)?;
            for batch in &batches {
                if let Some(norm) = self.value_normalizer.as_mut() {
                    norm.update(&batch.returns);
                }
                let tensors =
                    BatchTensors::new(batch, self.value_normalizer.as_ref(), self.policy.device());
                self.auxiliary_update(&tensors, &mut stats)?;
            }
        }

        stats.finalize(
            self.config.ppo_epoch * self.config.num_mini_batch,
            self.config.aux_epoch * self.config.num_mini_batch,
        );
        Ok(stats)
    }

    fn policy_update(
        &mut self,
        batch: &BatchTensors,
        stats: &mut TrainStats,
    ) -> Result<(), TrainError> {
        if batch.active_sum() == 0.0 {
            return Err(TrainError::DegenerateBatch {
                context: "policy-phase minibatch",
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
            Some(&batch.active_masks),
        );

        let ratio = (&eval.action_log_probs - &batch.old_action_log_probs).exp();

        // kl = p * log(p / q), estimated on the stored actions.
        let kl = batch.old_action_log_probs.exp()
            * (&batch.old_action_log_probs - &eval.action_log_probs);
        let kl_loss = masked_mean(&kl, &batch.active_masks);

        let clip = f64::from(self.config.clip_param);
        let surr1 = &ratio * &batch.advantages;
        let surr2 = ratio.clamp(1.0 - clip, 1.0 + clip) * &batch.advantages;
        let action_loss = -masked_mean(&surr1.min_other(&surr2), &batch.active_masks);

        let objective = &action_loss - &eval.dist_entropy * f64::from(self.config.entropy_coef);
        let grad_norm = self.policy.actor_backward_step(&objective, self.max_norm());

        stats.action_loss += f64::try_from(action_loss)?;
        stats.dist_entropy += f64::try_from(eval.dist_entropy)?;
        stats.actor_grad_norm += grad_norm;
        stats.kl_loss += f64::try_from(kl_loss)?;
        stats.ratio += f64::try_from(ratio.mean(tch::Kind::Float))?;
        Ok(())
    }

    fn value_update(
        &mut self,
        batch: &BatchTensors,
        stats: &mut TrainStats,
    ) -> Result<(), TrainError> {
        let eval = self.policy.evaluate_actions(
            &batch.share_obs,
            &batch.obs,
            &batch.rnn_states,
            &batch.rnn_states_critic,
            &batch.actions,
            &batch.masks,
            batch.available_actions.as_ref(),
            Some(&batch.active_masks),
        );
        let v_loss = value_loss(
            &self.config,
            &eval.values,
            &batch.value_preds,
            &batch.returns,
            &batch.active_masks,
        );
        let objective = &v_loss * f64::from(self.config.value_loss_coef);
        let grad_norm = self.policy.critic_backward_step(&objective, self.max_norm());

        stats.value_loss += f64::try_from(v_loss)?;
        stats.critic_grad_norm += grad_norm;
        Ok(())
    }

    fn auxiliary_update(
        &mut self,
        batch: &BatchTensors,
        stats: &mut TrainStats,
    ) -> Result<(), TrainError> {
        if batch.active_sum() == 0.0 {
            return Err(TrainError::DegenerateBatch {
                context: "auxiliary minibatch",
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
            Some(&batch.active_masks),
        );

        let kl = batch.old_action_log_probs.exp()
            * (&batch.old_action_log_probs - &eval.action_log_probs);
        let kl_loss = masked_mean(&kl, &batch.active_masks);

        let v_loss = value_loss(
            &self.config,
            &eval.values,
            &batch.value_preds,
            &batch.returns,
            &batch.active_masks,
        );

        let joint_loss = v_loss + kl_loss * f64::from(self.config.clone_coef);
        let grad_norm = self.policy.joint_backward_step(&joint_loss, self.max_norm());

        stats.joint_loss += f64::try_from(joint_loss)?;
        stats.joint_grad_norm += grad_norm;
        Ok(())
    }

    /// Overwrites every stored log-prob with the current policy's
    /// log-prob of the stored action.
    fn refresh_action_log_probs(&mut self, buffer: &mut RolloutBuffer) -> Result<(), TrainError> {
        let device = self.policy.device();
        for step in 0..buffer.episode_length() {
            let rows = (buffer.n_envs() * buffer.n_agents()) as i64;
            let obs = Tensor::from_slice(buffer.obs_step(step))
                .reshape([rows, -1])
                .to_device(device);
            let rnn_states = Tensor::from_slice(buffer.rnn_states_step(step))
                .reshape([rows, -1])
                .to_device(device);
            let actions = Tensor::from_slice(buffer.actions_step(step))
                .reshape([rows, -1])
                .to_device(device);
            let masks = Tensor::from_slice(buffer.masks_step(step))
                .reshape([rows, 1])
                .to_device(device);
            let available_actions = buffer.available_actions_step(step).map(|avail| {
                Tensor::from_slice(avail).reshape([rows, -1]).to_device(device)
            });

            let log_probs = self.policy.get_logprobs(
                &obs,
                &rnn_states,
                &actions,
                &masks,
                available_actions.as_ref(),
            );
            let log_probs: Vec<f32> = Vec::try_from(log_probs.reshape([-1]))?;
            buffer.set_action_log_probs(step, &log_probs)?;
        }
        Ok(())
    }

    fn max_norm(&self) -> Option<f64> {
        self.config
            .use_max_grad_norm
            .then_some(f64::from(self.config.max_grad_norm))
    }
}
