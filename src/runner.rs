//! Training loop driver.
//!
//! [`Runner`] owns the buffer, the trainer (which owns the policy), the
//! environment batch, and an injected metrics sink, and sequences one
//! collect/estimate/train/rotate cycle per iteration. Collection reads
//! the step inputs the buffer already holds, so the driver never keeps
//! a shadow copy of the environment state. Everything runs on one
//! logical thread.

use std::collections::HashMap;

use tch::Tensor;

use crate::config::TrainConfig;
use crate::env::{StepInfo, VectorEnv};
use crate::error::{BufferError, RunnerError, TrainError};
use crate::metrics::MetricsSink;
use crate::policy::ActorCriticPolicy;
use crate::storage::{RolloutBuffer, StepRecord};
use crate::trainer::{TrainStats, TrainerVariant};

/// Collection-time policy outputs for one step, back in flat form.
struct CollectedStep {
    values: Vec<f32>,
    actions: Vec<f32>,
    action_log_probs: Vec<f32>,
    rnn_states: Vec<f32>,
    rnn_states_critic: Vec<f32>,
}

/// The outer training loop: collect a rollout, compute return targets,
/// run the trainer, rotate the buffer, report metrics.
pub struct Runner<E: VectorEnv, P: ActorCriticPolicy, M: MetricsSink> {
    env: E,
    trainer: TrainerVariant<P>,
    buffer: RolloutBuffer,
    config: TrainConfig,
    metrics: M,
    total_env_steps: u64,
    /// Sums and counts of per-step info scalars for the current rollout.
    episode_scalars: HashMap<String, (f64, u64)>,
}

impl<E: VectorEnv, P: ActorCriticPolicy, M: MetricsSink> Runner<E, P, M> {
    /// Validates the configuration against the environment's geometry,
    /// resets the environment, and seeds the buffer with the initial
    /// observations.
    pub fn new(
        config: &TrainConfig,
        mut env: E,
        trainer: TrainerVariant<P>,
        metrics: M,
    ) -> Result<Self, RunnerError> {
        config.validate()?;
        Self::check_geometry("n_envs", config.n_rollout_threads, env.n_envs())?;
        Self::check_geometry("n_agents", config.n_agents, env.n_agents())?;

        let space = env.action_space();
        let mut buffer = RolloutBuffer::new(
            config,
            env.obs_dim(),
            env.share_obs_dim(),
            trainer.policy().recurrent_dim(),
            &space,
        )?;

        let reset = env.reset()?;
        let avail = (!reset.available_actions.is_empty()).then_some(&reset.available_actions[..]);
        buffer.seed_initial(&reset.share_obs, &reset.obs, avail)?;

        Ok(Runner {
            env,
            trainer,
            buffer,
            config: config.clone(),
            metrics,
            total_env_steps: 0,
            episode_scalars: HashMap::new(),
        })
    }

    fn check_geometry(field: &'static str, expected: usize, got: usize) -> Result<(), RunnerError> {
        if expected != got {
            return Err(BufferError::ShapeMismatch {
                field,
                expected,
                got,
            }
            .into());
        }
        Ok(())
    }

    /// Runs `iterations` full collect-and-train cycles.
    pub fn run(&mut self, iterations: usize) -> Result<(), RunnerError> {
        for i in 0..iterations {
            let stats = self.run_iteration()?;
            log::info!(
                "iteration {} of {}: env_steps={} value_loss={:.6} action_loss={:.6}",
                i + 1,
                iterations,
                self.total_env_steps,
                stats.value_loss,
                stats.action_loss,
            );
        }
        Ok(())
    }

    /// One collect/train cycle. Returns the averaged training statistics.
    pub fn run_iteration(&mut self) -> Result<TrainStats, RunnerError> {
        self.collect_rollout()?;
        let average_step_reward = self.average_step_reward();
        let stats = self.update()?;
        self.emit_metrics(&stats, average_step_reward);
        Ok(stats)
    }

    pub fn total_env_steps(&self) -> u64 {
        self.total_env_steps
    }

    pub fn trainer(&self) -> &TrainerVariant<P> {
        &self.trainer
    }

    pub fn trainer_mut(&mut self) -> &mut TrainerVariant<P> {
        &mut self.trainer
    }

    pub fn metrics(&self) -> &M {
        &self.metrics
    }

    fn collect_rollout(&mut self) -> Result<(), RunnerError> {
        self.trainer.prep_rollout();
        for step in 0..self.config.episode_length {
            let collected = self.act(step)?;
            let env_actions = self.to_env_actions(&collected.actions)?;
            let out = self.env.step(&env_actions)?;
            self.accumulate_scalars(&out.infos);

            let (masks, active_masks, bad_masks) =
                derive_masks(&out.dones, &out.infos, self.env.n_agents());

            let record = StepRecord {
                share_obs: out.share_obs,
                obs: out.obs,
                rnn_states: collected.rnn_states,
                rnn_states_critic: collected.rnn_states_critic,
                actions: collected.actions,
                action_log_probs: collected.action_log_probs,
                value_preds: collected.values,
                rewards: out.rewards,
                masks,
                bad_masks: Some(bad_masks),
                active_masks: Some(active_masks),
                available_actions: (!out.available_actions.is_empty())
                    .then_some(out.available_actions),
            };
            self.buffer.insert(&record)?;
            self.total_env_steps += self.env.n_envs() as u64;
        }
        Ok(())
    }

    /// Queries the policy on the step inputs stored at slot `step`.
    fn act(&self, step: usize) -> Result<CollectedStep, RunnerError> {
        let policy = self.trainer.policy();
        let device = policy.device();
        let rows = (self.env.n_envs() * self.env.n_agents()) as i64;
        let wide = |data: &[f32]| Tensor::from_slice(data).reshape([rows, -1]).to_device(device);

        let share_obs = wide(self.buffer.share_obs_step(step));
        let obs = wide(self.buffer.obs_step(step));
        let rnn_states = wide(self.buffer.rnn_states_step(step));
        let rnn_states_critic = wide(self.buffer.rnn_states_critic_step(step));
        let masks = Tensor::from_slice(self.buffer.masks_step(step))
            .reshape([rows, 1])
            .to_device(device);
        let available_actions = self.buffer.available_actions_step(step).map(wide);

        let out = policy.get_actions(
            &share_obs,
            &obs,
            &rnn_states,
            &rnn_states_critic,
            &masks,
            available_actions.as_ref(),
            false,
        );

        Ok(CollectedStep {
            values: flat(out.values)?,
            actions: flat(out.actions)?,
            action_log_probs: flat(out.action_log_probs)?,
            rnn_states: flat(out.rnn_states)?,
            rnn_states_critic: flat(out.rnn_states_critic)?,
        })
    }

    /// Rearranges the flat policy actions into one index row per
    /// (env, agent) cell for the environment boundary.
    fn to_env_actions(&self, actions: &[f32]) -> Result<Vec<Vec<i64>>, RunnerError> {
        let space = self.env.action_space();
        let act_dim = self.buffer.act_dim;
        let cells = self.env.n_envs() * self.env.n_agents();
        let mut rows = Vec::with_capacity(cells);
        for c in 0..cells {
            rows.push(space.to_env_indices(&actions[c * act_dim..(c + 1) * act_dim])?);
        }
        Ok(rows)
    }

    fn accumulate_scalars(&mut self, infos: &[StepInfo]) {
        for info in infos {
            for (key, value) in &info.episode_scalars {
                let entry = self.episode_scalars.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }
    }

    fn average_step_reward(&self) -> f64 {
        let n = self.config.rollout_size();
        let sum: f64 = self.buffer.rewards[..n].iter().map(|&r| f64::from(r)).sum();
        sum / n as f64
    }

    /// Return estimation, training, and buffer rotation, in that order.
    fn update(&mut self) -> Result<TrainStats, RunnerError> {
        let next_value = self.bootstrap_value()?;
        self.buffer
            .compute_returns(&next_value, &self.config, self.trainer.value_normalizer())?;
        self.trainer.prep_training();
        let stats = self.trainer.train(&mut self.buffer)?;
        self.buffer.after_update()?;
        Ok(stats)
    }

    /// Critic estimate on the post-rollout observations.
    fn bootstrap_value(&self) -> Result<Vec<f32>, RunnerError> {
        let policy = self.trainer.policy();
        let device = policy.device();
        let last = self.config.episode_length;
        let rows = (self.env.n_envs() * self.env.n_agents()) as i64;

        let share_obs = Tensor::from_slice(self.buffer.share_obs_step(last))
            .reshape([rows, -1])
            .to_device(device);
        let rnn_states_critic = Tensor::from_slice(self.buffer.rnn_states_critic_step(last))
            .reshape([rows, -1])
            .to_device(device);
        let masks = Tensor::from_slice(self.buffer.masks_step(last))
            .reshape([rows, 1])
            .to_device(device);

        flat(policy.get_values(&share_obs, &rnn_states_critic, &masks))
    }

    fn emit_metrics(&mut self, stats: &TrainStats, average_step_reward: f64) {
        let step = self.total_env_steps;
        for (name, value) in stats.entries() {
            self.metrics.scalar(name, value, step);
        }
        self.metrics
            .scalar("average_step_reward", average_step_reward, step);
        for (key, (sum, count)) in self.episode_scalars.drain() {
            self.metrics
                .scalar(&format!("episode/{key}"), sum / count as f64, step);
        }
    }
}

fn flat(tensor: Tensor) -> Result<Vec<f32>, RunnerError> {
    let data = Vec::<f32>::try_from(tensor.reshape([-1])).map_err(TrainError::from)?;
    Ok(data)
}

/// Mask derivation from environment terminals.
///
/// An episode mask drops to 0 only when every agent in the environment
/// is done; an agent that finishes early inside a running episode is
/// marked inactive instead. The bad mask follows the `bad_transition`
/// flag directly, so the estimator can suppress bootstrapping across
/// time-limit truncations.
fn derive_masks(
    dones: &[bool],
    infos: &[StepInfo],
    n_agents: usize,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let cells = dones.len();
    let mut masks = vec![1.0f32; cells];
    let mut active_masks = vec![1.0f32; cells];
    let mut bad_masks = vec![1.0f32; cells];

    for env_start in (0..cells).step_by(n_agents) {
        let env_cells = env_start..env_start + n_agents;
        let env_done = env_cells.clone().all(|c| dones[c]);
        for c in env_cells {
            if infos[c].bad_transition {
                bad_masks[c] = 0.0;
            }
            if env_done {
                masks[c] = 0.0;
            } else if dones[c] {
                active_masks[c] = 0.0;
            }
        }
    }
    (masks, active_masks, bad_masks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainConfig;
    use crate::env::{EnvReset, EnvStep};
    use crate::error::EnvError;
    use crate::metrics::MemoryMetrics;
    use crate::policy::MlpPolicy;
    use crate::spaces::ActionSpace;
    use crate::trainer::{MappgTrainer, MappoTrainer};
    use tch::Device;

    const N_ENVS: usize = 2;
    const N_AGENTS: usize = 3;
    const OBS_DIM: usize = 4;
    const SHARE_OBS_DIM: usize = 6;
    const N_ACTIONS: usize = 3;

    /// Deterministic batch of two environments. Agent 0 of environment 0
    /// finishes early at the second step; environment 1 terminates via
    /// time limit at its fourth step and auto-resets.
    struct MockEnv {
        step_count: usize,
    }

    impl MockEnv {
        fn new() -> Self {
            MockEnv { step_count: 0 }
        }

        fn obs(&self) -> Vec<f32> {
            (0..N_ENVS * N_AGENTS * OBS_DIM)
                .map(|i| (i % 5) as f32 * 0.1)
                .collect()
        }

        fn share_obs(&self) -> Vec<f32> {
            (0..N_ENVS * N_AGENTS * SHARE_OBS_DIM)
                .map(|i| (i % 7) as f32 * 0.1)
                .collect()
        }
    }

    impl VectorEnv for MockEnv {
        fn reset(&mut self) -> Result<EnvReset, EnvError> {
            Ok(EnvReset {
                obs: self.obs(),
                share_obs: self.share_obs(),
                available_actions: vec![1.0; N_ENVS * N_AGENTS * N_ACTIONS],
            })
        }

        fn step(&mut self, actions: &[Vec<i64>]) -> Result<EnvStep, EnvError> {
            assert_eq!(actions.len(), N_ENVS * N_AGENTS);
            for row in actions {
                assert_eq!(row.len(), 1);
                assert!((0..N_ACTIONS as i64).contains(&row[0]));
            }
            let agent0_done = self.step_count == 1;
            let env1_done = self.step_count == 3;
            self.step_count += 1;

            let mut dones = vec![false; N_ENVS * N_AGENTS];
            if agent0_done {
                dones[0] = true;
            }
            let mut info = StepInfo::default();
            info.episode_scalars.insert("score".to_string(), 2.0);
            let mut infos = vec![info; N_ENVS * N_AGENTS];
            if env1_done {
                for a in 0..N_AGENTS {
                    dones[N_AGENTS + a] = true;
                    infos[N_AGENTS + a].bad_transition = true;
                }
            }
            Ok(EnvStep {
                obs: self.obs(),
                share_obs: self.share_obs(),
                rewards: vec![0.5; N_ENVS * N_AGENTS],
                dones,
                infos,
                available_actions: vec![1.0; N_ENVS * N_AGENTS * N_ACTIONS],
            })
        }

        fn n_envs(&self) -> usize {
            N_ENVS
        }

        fn n_agents(&self) -> usize {
            N_AGENTS
        }

        fn obs_dim(&self) -> usize {
            OBS_DIM
        }

        fn share_obs_dim(&self) -> usize {
            SHARE_OBS_DIM
        }

        fn action_space(&self) -> ActionSpace {
            ActionSpace::Discrete { n: N_ACTIONS }
        }
    }

    fn test_config() -> TrainConfig {
        TrainConfig {
            episode_length: 5,
            n_rollout_threads: N_ENVS,
            n_agents: N_AGENTS,
            hidden_size: 16,
            ppo_epoch: 2,
            aux_epoch: 2,
            num_mini_batch: 1,
            ..TrainConfig::default()
        }
    }

    fn test_policy(config: &TrainConfig) -> MlpPolicy {
        MlpPolicy::new(
            config,
            OBS_DIM,
            SHARE_OBS_DIM,
            &ActionSpace::Discrete { n: N_ACTIONS },
            Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn derive_masks_handles_partial_and_full_termination() {
        // Env 0: one agent dies early. Env 1: full termination via time limit.
        let dones = vec![true, false, false, true, true, true];
        let mut infos = vec![StepInfo::default(); 6];
        for info in infos.iter_mut().skip(3) {
            info.bad_transition = true;
        }
        // The flag is honored even when the environment keeps running.
        infos[1].bad_transition = true;
        let (masks, active, bad) = derive_masks(&dones, &infos, 3);
        assert_eq!(masks, vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
        assert_eq!(active, vec![0.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(bad, vec![1.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn mappo_iteration_produces_finite_losses_and_mask_table() {
        let config = test_config();
        let trainer =
            TrainerVariant::Mappo(MappoTrainer::new(&config, test_policy(&config), 7).unwrap());
        let mut runner =
            Runner::new(&config, MockEnv::new(), trainer, MemoryMetrics::new()).unwrap();

        // Collect only, to inspect the stored mask tables before training.
        runner.collect_rollout().unwrap();
        let cells = N_ENVS * N_AGENTS;
        for step in 1..=config.episode_length {
            let masks = runner.buffer.masks_step(step);
            let active = runner.buffer.active_masks_step(step);
            for e in 0..N_ENVS {
                for a in 0..N_AGENTS {
                    let c = e * N_AGENTS + a;
                    // Env 1 terminated at collection step 3, recorded at
                    // slot 4; env 0's agent 0 dropped out at step 1.
                    let expected_mask = if e == 1 && step == 4 { 0.0 } else { 1.0 };
                    let expected_active = if c == 0 && step == 2 { 0.0 } else { 1.0 };
                    let expected_bad = if e == 1 && step == 4 { 0.0 } else { 1.0 };
                    assert_eq!(masks[c], expected_mask, "mask slot {step} cell {c}");
                    assert_eq!(active[c], expected_active, "active slot {step} cell {c}");
                    assert_eq!(
                        runner.buffer.bad_masks[step * cells + c],
                        expected_bad,
                        "bad slot {step} cell {c}"
                    );
                }
            }
        }
        assert_eq!(runner.total_env_steps(), (config.episode_length * N_ENVS) as u64);

        let average_step_reward = runner.average_step_reward();
        let stats = runner.update().unwrap();
        runner.emit_metrics(&stats, average_step_reward);

        assert!(stats.value_loss.is_finite());
        assert!(stats.action_loss.is_finite());
        assert!(stats.dist_entropy.is_finite());
        assert!(stats.actor_grad_norm.is_finite());
        assert!(stats.critic_grad_norm.is_finite());
        assert!((runner.metrics().get("average_step_reward").unwrap() - 0.5).abs() < 1e-6);
        assert!((runner.metrics().get("episode/score").unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn mappg_iteration_produces_finite_losses() {
        let config = test_config();
        let trainer =
            TrainerVariant::Mappg(MappgTrainer::new(&config, test_policy(&config), 11).unwrap());
        let mut runner =
            Runner::new(&config, MockEnv::new(), trainer, MemoryMetrics::new()).unwrap();

        let stats = runner.run_iteration().unwrap();
        assert!(stats.value_loss.is_finite());
        assert!(stats.action_loss.is_finite());
        assert!(stats.kl_loss.is_finite());
        assert!(stats.joint_loss.is_finite());
        assert!(stats.joint_grad_norm.is_finite());
    }

    #[test]
    fn geometry_mismatch_is_rejected() {
        let config = TrainConfig {
            n_rollout_threads: 4,
            ..test_config()
        };
        let policy = test_policy(&config);
        let trainer = TrainerVariant::Mappo(MappoTrainer::new(&config, policy, 1).unwrap());
        let err = Runner::new(&config, MockEnv::new(), trainer, MemoryMetrics::new()).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Buffer(BufferError::ShapeMismatch { field: "n_envs", .. })
        ));
    }

    #[test]
    fn consecutive_iterations_reuse_the_rotated_buffer() {
        let config = test_config();
        let trainer =
            TrainerVariant::Mappo(MappoTrainer::new(&config, test_policy(&config), 3).unwrap());
        let mut runner =
            Runner::new(&config, MockEnv::new(), trainer, MemoryMetrics::new()).unwrap();
        runner.run(2).unwrap();
        assert_eq!(
            runner.total_env_steps(),
            (2 * config.episode_length * N_ENVS) as u64
        );
    }
}
