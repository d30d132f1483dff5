//! Gradient-update algorithms over a collected rollout.
//!
//! Two trainers share the storage and policy layers: [`MappoTrainer`]
//! runs clipped-surrogate updates, [`MappgTrainer`] adds an auxiliary
//! phase that distills the behavior policy into the value head. Both
//! consume minibatches from the generator matching the configured
//! recurrence mode and leave the buffer's stored data untouched, except
//! for the MAPPG log-prob refresh.

pub mod mappg;
pub mod mappo;
pub mod stats;

use rand::rngs::StdRng;
use tch::{Device, Tensor};

use crate::config::TrainConfig;
use crate::error::TrainError;
use crate::normalizer::PopArt;
use crate::policy::ActorCriticPolicy;
use crate::storage::{MiniBatch, RolloutBuffer};

pub use mappg::MappgTrainer;
pub use mappo::MappoTrainer;
pub use stats::TrainStats;

/// Elementwise Huber loss: quadratic within `delta` of zero, linear
/// beyond.
fn huber_loss(error: &Tensor, delta: f64) -> Tensor {
    let abs = error.abs();
    let quadratic = abs.clamp_max(delta);
    let linear = &abs - &quadratic;
    &quadratic * &quadratic * 0.5 + linear * delta
}

fn mse_loss(error: &Tensor) -> Tensor {
    error * error * 0.5
}

/// Mean of `values` weighted by `active`. The caller guarantees the
/// mask sum is nonzero.
fn masked_mean(values: &Tensor, active: &Tensor) -> Tensor {
    (values * active).sum(tch::Kind::Float) / active.sum(tch::Kind::Float)
}

/// Value loss against (possibly normalized) returns, with the
/// configured clipping, Huber, and active-mask treatments.
fn value_loss(
    config: &TrainConfig,
    values: &Tensor,
    value_preds: &Tensor,
    returns: &Tensor,
    active_masks: &Tensor,
) -> Tensor {
    let clip = f64::from(config.clip_param);
    let pred_clipped = value_preds + (values - value_preds).clamp(-clip, clip);
    let error_clipped = returns - pred_clipped;
    let error_original = returns - values;

    let (loss_clipped, loss_original) = if config.use_huber_loss {
        let delta = f64::from(config.huber_delta);
        (
            huber_loss(&error_clipped, delta),
            huber_loss(&error_original, delta),
        )
    } else {
        (mse_loss(&error_clipped), mse_loss(&error_original))
    };

    let loss = if config.use_clipped_value_loss {
        loss_original.max_other(&loss_clipped)
    } else {
        loss_original
    };

    if config.use_value_active_masks {
        masked_mean(&loss, active_masks)
    } else {
        loss.mean(tch::Kind::Float)
    }
}

/// A [`MiniBatch`] lifted onto the policy's device.
struct BatchTensors {
    share_obs: Tensor,
    obs: Tensor,
    rnn_states: Tensor,
    rnn_states_critic: Tensor,
    actions: Tensor,
    value_preds: Tensor,
    /// Normalized by the value normalizer when one is configured.
    returns: Tensor,
    masks: Tensor,
    active_masks: Tensor,
    old_action_log_probs: Tensor,
    advantages: Tensor,
    available_actions: Option<Tensor>,
}

impl BatchTensors {
    fn new(batch: &MiniBatch, normalizer: Option<&PopArt>, device: Device) -> Self {
        let rows = batch.len() as i64;
        let n_seqs = batch.n_seqs as i64;
        let wide = |data: &[f32], n: i64| {
            Tensor::from_slice(data).reshape([n, -1]).to_device(device)
        };
        let col = |data: &[f32]| Tensor::from_slice(data).reshape([rows, 1]).to_device(device);

        let returns = match normalizer {
            Some(norm) => {
                let mut normalized = batch.returns.clone();
                norm.normalize_slice(&mut normalized);
                col(&normalized)
            }
            None => col(&batch.returns),
        };

        BatchTensors {
            share_obs: wide(&batch.share_obs, rows),
            obs: wide(&batch.obs, rows),
            rnn_states: wide(&batch.rnn_states, n_seqs),
            rnn_states_critic: wide(&batch.rnn_states_critic, n_seqs),
            actions: wide(&batch.actions, rows),
            value_preds: col(&batch.value_preds),
            returns,
            masks: col(&batch.masks),
            active_masks: col(&batch.active_masks),
            old_action_log_probs: col(&batch.old_action_log_probs),
            advantages: col(&batch.advantages),
            available_actions: batch
                .available_actions
                .as_ref()
                .map(|avail| wide(avail, rows)),
        }
    }

    fn active_sum(&self) -> f64 {
        f64::try_from(self.active_masks.sum(tch::Kind::Float)).unwrap_or(0.0)
    }
}

/// Advantages normalized to zero mean and unit deviation.
///
/// When policy active masks are in use, the statistics are taken over
/// active transitions only; the normalization is still applied to every
/// entry so batch indexing stays aligned.
fn normalized_advantages(
    buffer: &RolloutBuffer,
    normalizer: Option<&PopArt>,
    use_policy_active_masks: bool,
) -> Result<Vec<f32>, TrainError> {
    let mut advantages = buffer.raw_advantages(normalizer);
    let transitions = advantages.len();
    let active = &buffer.active_masks[..transitions];

    let mut count = 0usize;
    let mut sum = 0.0f64;
    for (i, &a) in advantages.iter().enumerate() {
        if !use_policy_active_masks || active[i] > 0.0 {
            sum += f64::from(a);
            count += 1;
        }
    }
    if count == 0 {
        return Err(TrainError::DegenerateBatch {
            context: "advantage normalization",
        });
    }
    let mean = sum / count as f64;

    let mut var_sum = 0.0f64;
    for (i, &a) in advantages.iter().enumerate() {
        if !use_policy_active_masks || active[i] > 0.0 {
            let d = f64::from(a) - mean;
            var_sum += d * d;
        }
    }
    let std = (var_sum / count as f64).sqrt();

    let scale = 1.0 / (std + 1e-5);
    for a in advantages.iter_mut() {
        *a = ((f64::from(*a) - mean) * scale) as f32;
    }
    Ok(advantages)
}

/// One epoch of minibatches using the generator selected by the
/// recurrence flags.
fn generate_batches(
    buffer: &RolloutBuffer,
    advantages: &[f32],
    config: &TrainConfig,
    rng: &mut StdRng,
) -> Result<Vec<MiniBatch>, TrainError> {
    if config.use_recurrent_policy {
        buffer.recurrent_generator(
            advantages,
            config.num_mini_batch,
            config.data_chunk_length,
            rng,
        )
    } else if config.use_naive_recurrent_policy {
        buffer.naive_recurrent_generator(advantages, config.num_mini_batch, rng)
    } else {
        buffer.feed_forward_generator(advantages, config.num_mini_batch, rng)
    }
}

/// Either trainer behind one dispatch surface, so the driver is generic
/// over the algorithm choice.
pub enum TrainerVariant<P: ActorCriticPolicy> {
    Mappo(MappoTrainer<P>),
    Mappg(MappgTrainer<P>),
}

impl<P: ActorCriticPolicy> TrainerVariant<P> {
    pub fn train(&mut self, buffer: &mut RolloutBuffer) -> Result<TrainStats, TrainError> {
        match self {
            TrainerVariant::Mappo(t) => t.train(buffer),
            TrainerVariant::Mappg(t) => t.train(buffer),
        }
    }

    pub fn policy(&self) -> &P {
        match self {
            TrainerVariant::Mappo(t) => t.policy(),
            TrainerVariant::Mappg(t) => t.policy(),
        }
    }

    pub fn policy_mut(&mut self) -> &mut P {
        match self {
            TrainerVariant::Mappo(t) => t.policy_mut(),
            TrainerVariant::Mappg(t) => t.policy_mut(),
        }
    }

    pub fn value_normalizer(&self) -> Option<&PopArt> {
        match self {
            TrainerVariant::Mappo(t) => t.value_normalizer(),
            TrainerVariant::Mappg(t) => t.value_normalizer(),
        }
    }

    pub fn prep_rollout(&mut self) {
        self.policy_mut().prep_rollout();
    }

    pub fn prep_training(&mut self) {
        self.policy_mut().prep_training();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huber_is_quadratic_inside_delta_and_linear_outside() {
        let error = Tensor::from_slice(&[0.5f32, 3.0]);
        let loss = huber_loss(&error, 1.0);
        let loss: Vec<f32> = Vec::try_from(loss).unwrap();
        assert!((loss[0] - 0.125).abs() < 1e-6);
        assert!((loss[1] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn masked_mean_ignores_inactive_rows() {
        let values = Tensor::from_slice(&[1.0f32, 100.0, 3.0]);
        let active = Tensor::from_slice(&[1.0f32, 0.0, 1.0]);
        let mean = f64::try_from(masked_mean(&values, &active)).unwrap();
        assert!((mean - 2.0).abs() < 1e-6);
    }

    #[test]
    fn value_loss_clipping_bounds_the_update() {
        let config = TrainConfig {
            use_huber_loss: false,
            use_clipped_value_loss: true,
            use_value_active_masks: false,
            clip_param: 0.2,
            ..TrainConfig::default()
        };
        // New value moved far beyond the clip range: the clipped branch
        // dominates via the elementwise max.
        let values = Tensor::from_slice(&[10.0f32]).reshape([1, 1]);
        let value_preds = Tensor::from_slice(&[0.0f32]).reshape([1, 1]);
        let returns = Tensor::from_slice(&[0.0f32]).reshape([1, 1]);
        let active = Tensor::from_slice(&[1.0f32]).reshape([1, 1]);
        let loss = f64::try_from(value_loss(&config, &values, &value_preds, &returns, &active))
            .unwrap();
        // max(0.5 * 10^2, 0.5 * 0.2^2) = 50.
        assert!((loss - 50.0).abs() < 1e-5);
    }

    #[test]
    fn advantage_normalization_produces_zero_mean_unit_std() {
        let config = TrainConfig {
            episode_length: 4,
            n_rollout_threads: 2,
            n_agents: 2,
            ..TrainConfig::default()
        };
        let space = crate::spaces::ActionSpace::Discrete { n: 3 };
        let mut buffer = RolloutBuffer::new(&config, 3, 5, 4, &space).unwrap();
        for (i, v) in buffer.value_preds.iter_mut().enumerate() {
            *v = i as f32 * 0.25;
        }
        for (i, r) in buffer.returns.iter_mut().enumerate() {
            *r = (i % 7) as f32;
        }
        let advantages = normalized_advantages(&buffer, None, true).unwrap();
        let n = advantages.len() as f64;
        let mean: f64 = advantages.iter().map(|&a| f64::from(a)).sum::<f64>() / n;
        let var: f64 = advantages
            .iter()
            .map(|&a| (f64::from(a) - mean).powi(2))
            .sum::<f64>()
            / n;
        assert!(mean.abs() < 1e-5);
        assert!((var.sqrt() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn all_inactive_advantages_are_degenerate() {
        let config = TrainConfig {
            episode_length: 2,
            n_rollout_threads: 1,
            n_agents: 1,
            ..TrainConfig::default()
        };
        let space = crate::spaces::ActionSpace::Discrete { n: 2 };
        let mut buffer = RolloutBuffer::new(&config, 2, 2, 4, &space).unwrap();
        for m in buffer.active_masks.iter_mut() {
            *m = 0.0;
        }
        let err = normalized_advantages(&buffer, None, true).unwrap_err();
        assert!(matches!(err, TrainError::DegenerateBatch { .. }));
    }

    #[test]
    fn batch_tensors_normalize_returns_when_configured() {
        let batch = MiniBatch {
            seq_len: 1,
            n_seqs: 2,
            share_obs: vec![0.0; 4],
            obs: vec![0.0; 4],
            rnn_states: vec![0.0; 4],
            rnn_states_critic: vec![0.0; 4],
            actions: vec![0.0; 2],
            value_preds: vec![0.0; 2],
            returns: vec![5.0, 7.0],
            masks: vec![1.0; 2],
            active_masks: vec![1.0; 2],
            old_action_log_probs: vec![0.0; 2],
            advantages: vec![0.0; 2],
            available_actions: None,
        };
        let mut norm = PopArt::default();
        norm.update(&[5.0, 7.0]);
        let tensors = BatchTensors::new(&batch, Some(&norm), Device::Cpu);
        let raw: Vec<f32> = Vec::try_from(tensors.returns.reshape([-1])).unwrap();
        let mut expected = vec![5.0f32, 7.0];
        norm.normalize_slice(&mut expected);
        assert!((raw[0] - expected[0]).abs() < 1e-6);
        assert!((raw[1] - expected[1]).abs() < 1e-6);
        assert_eq!(tensors.masks.size(), vec![2, 1]);
    }
}
