//! Rollout storage across parallel environments and agents.
//!
//! One buffer holds `episode_length + 1` time slots × `n_rollout_threads`
//! environments × `n_agents` agents of every transition field, as flat
//! `f32` arrays with explicit shapes. Slot 0 always carries the state
//! left over from the end of the previous rollout; slot `episode_length`
//! holds the bootstrap observation. Every boundary validates incoming
//! lengths against the declared shapes, so a mismatched field fails with
//! a diagnostic naming it rather than silently misaligning.

use crate::config::TrainConfig;
use crate::error::{BufferError, ConfigError};
use crate::normalizer::PopArt;
use crate::spaces::ActionSpace;
use crate::storage::gae;

/// One synchronous step of data for [`RolloutBuffer::insert`].
///
/// Observation-like fields describe the state *after* stepping the
/// environment; actions, log-probs, values, and rewards describe the
/// step just taken. All arrays are `[n_envs × n_agents × dim]` flat.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub share_obs: Vec<f32>,
    pub obs: Vec<f32>,
    pub rnn_states: Vec<f32>,
    pub rnn_states_critic: Vec<f32>,
    pub actions: Vec<f32>,
    pub action_log_probs: Vec<f32>,
    pub value_preds: Vec<f32>,
    pub rewards: Vec<f32>,
    /// 1.0 while the episode is alive after this step, 0.0 at a terminal.
    pub masks: Vec<f32>,
    /// 0.0 when the episode ended due to a time limit; defaults to ones.
    pub bad_masks: Option<Vec<f32>>,
    /// 0.0 for agents that finished early within a running episode;
    /// defaults to ones.
    pub active_masks: Option<Vec<f32>>,
    /// Legal-action masks; required iff the space has action masking.
    pub available_actions: Option<Vec<f32>>,
}

/// One turn of data for [`RolloutBuffer::choose_insert`], where exactly
/// one agent acts per environment. Per-agent arrays are `[n_envs × dim]`
/// and describe the acting agent; masks are per environment and apply to
/// all of its agents.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    /// Index of the acting agent in each environment.
    pub agent_turn: Vec<usize>,
    pub share_obs: Vec<f32>,
    pub obs: Vec<f32>,
    pub rnn_states: Vec<f32>,
    pub rnn_states_critic: Vec<f32>,
    pub actions: Vec<f32>,
    pub action_log_probs: Vec<f32>,
    pub value_preds: Vec<f32>,
    pub rewards: Vec<f32>,
    pub masks: Vec<f32>,
    pub bad_masks: Option<Vec<f32>>,
    pub available_actions: Option<Vec<f32>>,
}

/// Fixed-capacity trajectory storage feeding the minibatch generators.
#[derive(Debug, Clone)]
pub struct RolloutBuffer {
    pub(crate) episode_length: usize,
    pub(crate) n_envs: usize,
    pub(crate) n_agents: usize,
    pub(crate) obs_dim: usize,
    pub(crate) share_obs_dim: usize,
    pub(crate) recurrent_dim: usize,
    pub(crate) act_dim: usize,
    pub(crate) n_actions: usize,

    /// Write cursor: number of steps inserted since the last rotation.
    step: usize,

    pub(crate) share_obs: Vec<f32>,
    pub(crate) obs: Vec<f32>,
    pub(crate) rnn_states: Vec<f32>,
    pub(crate) rnn_states_critic: Vec<f32>,
    pub(crate) value_preds: Vec<f32>,
    pub(crate) returns: Vec<f32>,
    pub(crate) actions: Vec<f32>,
    pub(crate) action_log_probs: Vec<f32>,
    pub(crate) rewards: Vec<f32>,
    pub(crate) masks: Vec<f32>,
    pub(crate) bad_masks: Vec<f32>,
    pub(crate) active_masks: Vec<f32>,
    pub(crate) available_actions: Vec<f32>,
}

impl RolloutBuffer {
    /// Creates an empty buffer for the given geometry.
    ///
    /// The configuration is validated first, so a zero-length rollout or
    /// conflicting mode flags never reach the storage layer.
    /// `recurrent_dim` is the flattened width of one recurrent state
    /// vector; the buffer treats those states as opaque.
    pub fn new(
        config: &TrainConfig,
        obs_dim: usize,
        share_obs_dim: usize,
        recurrent_dim: usize,
        action_space: &ActionSpace,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let t = config.episode_length;
        let e = config.n_rollout_threads;
        let a = config.n_agents;
        let cells = e * a;
        let act_dim = action_space.flat_dim();
        let n_actions = action_space.available_actions_dim();

        Ok(Self {
            episode_length: t,
            n_envs: e,
            n_agents: a,
            obs_dim,
            share_obs_dim,
            recurrent_dim,
            act_dim,
            n_actions,
            step: 0,
            share_obs: vec![0.0; (t + 1) * cells * share_obs_dim],
            obs: vec![0.0; (t + 1) * cells * obs_dim],
            rnn_states: vec![0.0; (t + 1) * cells * recurrent_dim],
            rnn_states_critic: vec![0.0; (t + 1) * cells * recurrent_dim],
            value_preds: vec![0.0; (t + 1) * cells],
            returns: vec![0.0; (t + 1) * cells],
            actions: vec![0.0; t * cells * act_dim],
            action_log_probs: vec![0.0; t * cells],
            rewards: vec![0.0; t * cells],
            masks: vec![1.0; (t + 1) * cells],
            bad_masks: vec![1.0; (t + 1) * cells],
            active_masks: vec![1.0; (t + 1) * cells],
            available_actions: vec![1.0; (t + 1) * cells * n_actions],
        })
    }

    /// Number of steps inserted since the last rotation.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn episode_length(&self) -> usize {
        self.episode_length
    }

    pub fn n_envs(&self) -> usize {
        self.n_envs
    }

    pub fn n_agents(&self) -> usize {
        self.n_agents
    }

    /// Flat index of cell `(env, agent)` within one time slot.
    #[inline]
    pub(crate) fn cell(&self, env: usize, agent: usize) -> usize {
        env * self.n_agents + agent
    }

    /// Flat index of `(t, env, agent)` for width-1 fields.
    #[inline]
    pub(crate) fn idx(&self, t: usize, env: usize, agent: usize) -> usize {
        (t * self.n_envs + env) * self.n_agents + agent
    }

    fn cells(&self) -> usize {
        self.n_envs * self.n_agents
    }

    fn check_len(field: &'static str, got: usize, expected: usize) -> Result<(), BufferError> {
        if got != expected {
            return Err(BufferError::ShapeMismatch {
                field,
                expected,
                got,
            });
        }
        Ok(())
    }

    /// Fills slot 0 with the observations produced by the environment
    /// reset. This is the base case of the carry-over invariant.
    pub fn seed_initial(
        &mut self,
        share_obs: &[f32],
        obs: &[f32],
        available_actions: Option<&[f32]>,
    ) -> Result<(), BufferError> {
        let cells = self.cells();
        Self::check_len("share_obs", share_obs.len(), cells * self.share_obs_dim)?;
        Self::check_len("obs", obs.len(), cells * self.obs_dim)?;
        self.share_obs[..share_obs.len()].copy_from_slice(share_obs);
        self.obs[..obs.len()].copy_from_slice(obs);
        if let Some(avail) = available_actions {
            Self::check_len("available_actions", avail.len(), cells * self.n_actions)?;
            self.available_actions[..avail.len()].copy_from_slice(avail);
        }
        Ok(())
    }

    /// Appends one synchronous step for every (env, agent).
    ///
    /// Observation-like fields land at slot `step + 1`; the step's
    /// actions, log-probs, values, and rewards land at slot `step`.
    /// The buffer owns the recurrent-state reset: wherever the incoming
    /// mask is 0, the recurrent states written at `step + 1` are forced
    /// to the zero vector.
    pub fn insert(&mut self, record: &StepRecord) -> Result<(), BufferError> {
        if self.step >= self.episode_length {
            return Err(BufferError::CapacityExceeded {
                capacity: self.episode_length,
                attempted: self.step + 1,
            });
        }
        let cells = self.cells();
        Self::check_len("share_obs", record.share_obs.len(), cells * self.share_obs_dim)?;
        Self::check_len("obs", record.obs.len(), cells * self.obs_dim)?;
        Self::check_len(
            "rnn_states",
            record.rnn_states.len(),
            cells * self.recurrent_dim,
        )?;
        Self::check_len(
            "rnn_states_critic",
            record.rnn_states_critic.len(),
            cells * self.recurrent_dim,
        )?;
        Self::check_len("actions", record.actions.len(), cells * self.act_dim)?;
        Self::check_len("action_log_probs", record.action_log_probs.len(), cells)?;
        Self::check_len("value_preds", record.value_preds.len(), cells)?;
        Self::check_len("rewards", record.rewards.len(), cells)?;
        Self::check_len("masks", record.masks.len(), cells)?;
        if let Some(bad) = &record.bad_masks {
            Self::check_len("bad_masks", bad.len(), cells)?;
        }
        if let Some(active) = &record.active_masks {
            Self::check_len("active_masks", active.len(), cells)?;
        }
        match (&record.available_actions, self.n_actions) {
            (Some(avail), n) if n > 0 => {
                Self::check_len("available_actions", avail.len(), cells * n)?
            }
            (Some(avail), 0) => {
                Self::check_len("available_actions", avail.len(), 0)?;
            }
            _ => {}
        }

        let t = self.step;
        let next = t + 1;

        copy_slot(&mut self.share_obs, next, cells * self.share_obs_dim, &record.share_obs);
        copy_slot(&mut self.obs, next, cells * self.obs_dim, &record.obs);
        copy_slot(
            &mut self.rnn_states,
            next,
            cells * self.recurrent_dim,
            &record.rnn_states,
        );
        copy_slot(
            &mut self.rnn_states_critic,
            next,
            cells * self.recurrent_dim,
            &record.rnn_states_critic,
        );
        copy_slot(&mut self.actions, t, cells * self.act_dim, &record.actions);
        copy_slot(&mut self.action_log_probs, t, cells, &record.action_log_probs);
        copy_slot(&mut self.value_preds, t, cells, &record.value_preds);
        copy_slot(&mut self.rewards, t, cells, &record.rewards);
        copy_slot(&mut self.masks, next, cells, &record.masks);
        match &record.bad_masks {
            Some(bad) => copy_slot(&mut self.bad_masks, next, cells, bad),
            None => fill_slot(&mut self.bad_masks, next, cells, 1.0),
        }
        match &record.active_masks {
            Some(active) => copy_slot(&mut self.active_masks, next, cells, active),
            None => fill_slot(&mut self.active_masks, next, cells, 1.0),
        }
        if self.n_actions > 0 {
            if let Some(avail) = &record.available_actions {
                copy_slot(
                    &mut self.available_actions,
                    next,
                    cells * self.n_actions,
                    avail,
                );
            }
        }

        // Episode boundary: the recurrent chain restarts from zero.
        for c in 0..cells {
            if record.masks[c] == 0.0 {
                let base = (next * cells + c) * self.recurrent_dim;
                self.rnn_states[base..base + self.recurrent_dim].fill(0.0);
                self.rnn_states_critic[base..base + self.recurrent_dim].fill(0.0);
            }
        }

        self.step = next;
        Ok(())
    }

    /// Appends one turn for turn-based environments where exactly one
    /// agent acts per environment step.
    ///
    /// Only the acting agent's slots are written. Non-acting agents'
    /// observation-like fields are carried forward from slot `step`, and
    /// their per-step fields (action, log-prob, value, reward) keep their
    /// last-seen values; whether that carry-forward should instead be
    /// explicitly marked is an open question inherited from the original
    /// design, so the behavior is preserved as-is. `bad_masks` semantics
    /// are unchanged from [`RolloutBuffer::insert`].
    pub fn choose_insert(&mut self, record: &TurnRecord) -> Result<(), BufferError> {
        if self.step >= self.episode_length {
            return Err(BufferError::CapacityExceeded {
                capacity: self.episode_length,
                attempted: self.step + 1,
            });
        }
        let e = self.n_envs;
        Self::check_len("agent_turn", record.agent_turn.len(), e)?;
        Self::check_len("share_obs", record.share_obs.len(), e * self.share_obs_dim)?;
        Self::check_len("obs", record.obs.len(), e * self.obs_dim)?;
        Self::check_len("rnn_states", record.rnn_states.len(), e * self.recurrent_dim)?;
        Self::check_len(
            "rnn_states_critic",
            record.rnn_states_critic.len(),
            e * self.recurrent_dim,
        )?;
        Self::check_len("actions", record.actions.len(), e * self.act_dim)?;
        Self::check_len("action_log_probs", record.action_log_probs.len(), e)?;
        Self::check_len("value_preds", record.value_preds.len(), e)?;
        Self::check_len("rewards", record.rewards.len(), e)?;
        Self::check_len("masks", record.masks.len(), e)?;
        if let Some(bad) = &record.bad_masks {
            Self::check_len("bad_masks", bad.len(), e)?;
        }
        if let Some(avail) = &record.available_actions {
            Self::check_len("available_actions", avail.len(), e * self.n_actions)?;
        }
        for &agent in &record.agent_turn {
            if agent >= self.n_agents {
                return Err(BufferError::ShapeMismatch {
                    field: "agent_turn",
                    expected: self.n_agents,
                    got: agent,
                });
            }
        }

        let t = self.step;
        let next = t + 1;
        let cells = self.cells();

        // Carry every agent's observation-like state forward, then
        // overwrite the acting agent's entries below.
        carry_slot(&mut self.share_obs, t, cells * self.share_obs_dim);
        carry_slot(&mut self.obs, t, cells * self.obs_dim);
        carry_slot(&mut self.rnn_states, t, cells * self.recurrent_dim);
        carry_slot(&mut self.rnn_states_critic, t, cells * self.recurrent_dim);
        if self.n_actions > 0 {
            carry_slot(&mut self.available_actions, t, cells * self.n_actions);
        }
        // Turn records carry no per-agent participation signal.
        fill_slot(&mut self.active_masks, next, cells, 1.0);

        for (env, &agent) in record.agent_turn.iter().enumerate() {
            let c = self.cell(env, agent);

            copy_cell(&mut self.share_obs, next, cells, c, self.share_obs_dim, &record.share_obs, env);
            copy_cell(&mut self.obs, next, cells, c, self.obs_dim, &record.obs, env);
            copy_cell(&mut self.rnn_states, next, cells, c, self.recurrent_dim, &record.rnn_states, env);
            copy_cell(
                &mut self.rnn_states_critic,
                next,
                cells,
                c,
                self.recurrent_dim,
                &record.rnn_states_critic,
                env,
            );
            copy_cell(&mut self.actions, t, cells, c, self.act_dim, &record.actions, env);
            self.action_log_probs[t * cells + c] = record.action_log_probs[env];
            self.value_preds[t * cells + c] = record.value_preds[env];
            self.rewards[t * cells + c] = record.rewards[env];
            if self.n_actions > 0 {
                if let Some(avail) = &record.available_actions {
                    copy_cell(
                        &mut self.available_actions,
                        next,
                        cells,
                        c,
                        self.n_actions,
                        avail,
                        env,
                    );
                }
            }

            // Episode-level masks apply to every agent in the environment.
            for a in 0..self.n_agents {
                let cell = self.cell(env, a);
                self.masks[next * cells + cell] = record.masks[env];
                self.bad_masks[next * cells + cell] = record
                    .bad_masks
                    .as_ref()
                    .map(|b| b[env])
                    .unwrap_or(1.0);
                if record.masks[env] == 0.0 {
                    let base = (next * cells + cell) * self.recurrent_dim;
                    self.rnn_states[base..base + self.recurrent_dim].fill(0.0);
                    self.rnn_states_critic[base..base + self.recurrent_dim].fill(0.0);
                }
            }
        }

        self.step = next;
        Ok(())
    }

    /// Rotates slot `episode_length` into slot 0 after a training update.
    ///
    /// Copies every field that needs continuity across rollouts
    /// (observations, recurrent states, the mask family, legal-action
    /// masks) and resets the write cursor. Calling before a full rollout
    /// is a usage error.
    pub fn after_update(&mut self) -> Result<(), BufferError> {
        if self.step != self.episode_length {
            return Err(BufferError::IncompleteRollout {
                inserted: self.step,
                expected: self.episode_length,
            });
        }
        let cells = self.cells();
        let last = self.episode_length;

        rotate_slot(&mut self.share_obs, last, cells * self.share_obs_dim);
        rotate_slot(&mut self.obs, last, cells * self.obs_dim);
        rotate_slot(&mut self.rnn_states, last, cells * self.recurrent_dim);
        rotate_slot(&mut self.rnn_states_critic, last, cells * self.recurrent_dim);
        rotate_slot(&mut self.masks, last, cells);
        rotate_slot(&mut self.bad_masks, last, cells);
        rotate_slot(&mut self.active_masks, last, cells);
        if self.n_actions > 0 {
            rotate_slot(&mut self.available_actions, last, cells * self.n_actions);
        }

        self.step = 0;
        Ok(())
    }

    /// Back-fills `returns` from the bootstrap values.
    ///
    /// Must run strictly after a complete rollout and strictly before
    /// [`RolloutBuffer::after_update`]. `next_value` is the critic's
    /// estimate on the post-rollout observation, `[n_envs × n_agents]`.
    pub fn compute_returns(
        &mut self,
        next_value: &[f32],
        config: &TrainConfig,
        normalizer: Option<&PopArt>,
    ) -> Result<(), BufferError> {
        if self.step != self.episode_length {
            return Err(BufferError::IncompleteRollout {
                inserted: self.step,
                expected: self.episode_length,
            });
        }
        let cells = self.cells();
        Self::check_len("next_value", next_value.len(), cells)?;

        let denorm = |v: f32| match normalizer {
            Some(n) => n.denormalize(v),
            None => v,
        };
        let last = self.episode_length;

        if config.use_gae {
            copy_slot(&mut self.value_preds, last, cells, next_value);
        }

        // One backward pass per (env, agent) series, in denormalized space.
        for c in 0..cells {
            let rewards: Vec<f32> = (0..last).map(|t| self.rewards[t * cells + c]).collect();
            let values: Vec<f32> = (0..=last)
                .map(|t| denorm(self.value_preds[t * cells + c]))
                .collect();
            let masks: Vec<f32> = (0..=last).map(|t| self.masks[t * cells + c]).collect();
            let bad_masks: Vec<f32> = (0..=last).map(|t| self.bad_masks[t * cells + c]).collect();

            let series = if config.use_gae {
                gae::gae_returns(
                    &rewards,
                    &values,
                    &masks,
                    &bad_masks,
                    config.gamma,
                    config.gae_lambda,
                    config.use_proper_time_limits,
                )
            } else {
                gae::discounted_returns(
                    &rewards,
                    &values,
                    &masks,
                    &bad_masks,
                    config.gamma,
                    config.use_proper_time_limits,
                    next_value[c],
                )
            };
            for (t, r) in series.into_iter().enumerate() {
                self.returns[t * cells + c] = r;
            }
        }
        if !config.use_gae {
            copy_slot(&mut self.returns, last, cells, next_value);
        }
        Ok(())
    }

    /// Raw (unnormalized) advantages, `[episode_length × n_envs × n_agents]`.
    pub fn raw_advantages(&self, normalizer: Option<&PopArt>) -> Vec<f32> {
        let n = self.episode_length * self.cells();
        let mut adv = Vec::with_capacity(n);
        for i in 0..n {
            let v = match normalizer {
                Some(norm) => norm.denormalize(self.value_preds[i]),
                None => self.value_preds[i],
            };
            adv.push(self.returns[i] - v);
        }
        adv
    }

    /// Overwrites the stored log-probabilities of one time slot.
    ///
    /// Used by the MAPPG auxiliary phase, which re-evaluates the whole
    /// buffer under the updated policy before its own epochs.
    pub fn set_action_log_probs(&mut self, step: usize, values: &[f32]) -> Result<(), BufferError> {
        if step >= self.episode_length {
            return Err(BufferError::StepOutOfBounds {
                step,
                episode_length: self.episode_length,
            });
        }
        let cells = self.cells();
        Self::check_len("action_log_probs", values.len(), cells)?;
        copy_slot(&mut self.action_log_probs, step, cells, values);
        Ok(())
    }

    // --- Per-slot read views used by the driver and trainers ---

    pub fn share_obs_step(&self, t: usize) -> &[f32] {
        slot(&self.share_obs, t, self.cells() * self.share_obs_dim)
    }

    pub fn obs_step(&self, t: usize) -> &[f32] {
        slot(&self.obs, t, self.cells() * self.obs_dim)
    }

    pub fn rnn_states_step(&self, t: usize) -> &[f32] {
        slot(&self.rnn_states, t, self.cells() * self.recurrent_dim)
    }

    pub fn rnn_states_critic_step(&self, t: usize) -> &[f32] {
        slot(&self.rnn_states_critic, t, self.cells() * self.recurrent_dim)
    }

    pub fn masks_step(&self, t: usize) -> &[f32] {
        slot(&self.masks, t, self.cells())
    }

    pub fn active_masks_step(&self, t: usize) -> &[f32] {
        slot(&self.active_masks, t, self.cells())
    }

    pub fn actions_step(&self, t: usize) -> &[f32] {
        slot(&self.actions, t, self.cells() * self.act_dim)
    }

    /// Legal-action masks at slot `t`, or `None` when the space has no masking.
    pub fn available_actions_step(&self, t: usize) -> Option<&[f32]> {
        if self.n_actions == 0 {
            None
        } else {
            Some(slot(&self.available_actions, t, self.cells() * self.n_actions))
        }
    }
}

#[inline]
fn slot(data: &[f32], t: usize, width: usize) -> &[f32] {
    &data[t * width..(t + 1) * width]
}

#[inline]
fn copy_slot(data: &mut [f32], t: usize, width: usize, src: &[f32]) {
    data[t * width..(t + 1) * width].copy_from_slice(src);
}

#[inline]
fn fill_slot(data: &mut [f32], t: usize, width: usize, value: f32) {
    data[t * width..(t + 1) * width].fill(value);
}

/// Copies slot `t` into slot `t + 1`.
#[inline]
fn carry_slot(data: &mut [f32], t: usize, width: usize) {
    let (src, dst) = data.split_at_mut((t + 1) * width);
    dst[..width].copy_from_slice(&src[t * width..]);
}

/// Copies slot `last` into slot 0.
#[inline]
fn rotate_slot(data: &mut [f32], last: usize, width: usize) {
    let (dst, src) = data.split_at_mut(last * width);
    dst[..width].copy_from_slice(&src[..width]);
}

/// Writes `record[env]`'s row of width `dim` into cell `c` of slot `t`.
#[inline]
fn copy_cell(
    data: &mut [f32],
    t: usize,
    cells: usize,
    c: usize,
    dim: usize,
    src: &[f32],
    env: usize,
) {
    let dst = (t * cells + c) * dim;
    data[dst..dst + dim].copy_from_slice(&src[env * dim..(env + 1) * dim]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> TrainConfig {
        TrainConfig {
            episode_length: 3,
            n_rollout_threads: 2,
            n_agents: 2,
            ..TrainConfig::default()
        }
    }

    fn small_buffer() -> RolloutBuffer {
        RolloutBuffer::new(
            &small_config(),
            2,
            3,
            4,
            &ActionSpace::Discrete { n: 5 },
        )
        .unwrap()
    }

    fn filled_record(buffer: &RolloutBuffer, fill: f32, masks: Vec<f32>) -> StepRecord {
        let cells = buffer.n_envs * buffer.n_agents;
        StepRecord {
            share_obs: vec![fill; cells * buffer.share_obs_dim],
            obs: vec![fill; cells * buffer.obs_dim],
            rnn_states: vec![fill; cells * buffer.recurrent_dim],
            rnn_states_critic: vec![fill; cells * buffer.recurrent_dim],
            actions: vec![1.0; cells * buffer.act_dim],
            action_log_probs: vec![-0.5; cells],
            value_preds: vec![0.5; cells],
            rewards: vec![1.0; cells],
            masks,
            bad_masks: None,
            active_masks: None,
            available_actions: Some(vec![1.0; cells * buffer.n_actions]),
        }
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = TrainConfig {
            episode_length: 0,
            ..small_config()
        };
        let err = RolloutBuffer::new(&config, 2, 3, 4, &ActionSpace::Discrete { n: 5 }).unwrap_err();
        assert_eq!(
            err,
            ConfigError::NonPositive {
                field: "episode_length",
            }
        );
    }

    #[test]
    fn insert_advances_cursor_and_overflows_loudly() {
        let mut buffer = small_buffer();
        let cells = buffer.n_envs * buffer.n_agents;
        for expected in 1..=3 {
            let record = filled_record(&buffer, 1.0, vec![1.0; cells]);
            buffer.insert(&record).unwrap();
            assert_eq!(buffer.step(), expected);
        }
        let record = filled_record(&buffer, 1.0, vec![1.0; cells]);
        assert_eq!(
            buffer.insert(&record),
            Err(BufferError::CapacityExceeded {
                capacity: 3,
                attempted: 4,
            })
        );
    }

    #[test]
    fn insert_rejects_mismatched_shapes() {
        let mut buffer = small_buffer();
        let cells = buffer.n_envs * buffer.n_agents;
        let mut record = filled_record(&buffer, 1.0, vec![1.0; cells]);
        record.obs.pop();
        assert_eq!(
            buffer.insert(&record),
            Err(BufferError::ShapeMismatch {
                field: "obs",
                expected: cells * 2,
                got: cells * 2 - 1,
            })
        );
    }

    #[test]
    fn zero_mask_forces_recurrent_states_to_zero() {
        let mut buffer = small_buffer();
        let cells = buffer.n_envs * buffer.n_agents;
        let mut masks = vec![1.0; cells];
        masks[1] = 0.0;
        masks[3] = 0.0;
        let record = filled_record(&buffer, 7.0, masks.clone());
        buffer.insert(&record).unwrap();

        let states = buffer.rnn_states_step(1);
        let critic_states = buffer.rnn_states_critic_step(1);
        for c in 0..cells {
            let row = &states[c * buffer.recurrent_dim..(c + 1) * buffer.recurrent_dim];
            let critic_row =
                &critic_states[c * buffer.recurrent_dim..(c + 1) * buffer.recurrent_dim];
            if masks[c] == 0.0 {
                assert!(row.iter().all(|&x| x == 0.0), "cell {c} not reset");
                assert!(critic_row.iter().all(|&x| x == 0.0), "critic cell {c} not reset");
            } else {
                assert!(row.iter().all(|&x| x == 7.0));
            }
        }
    }

    #[test]
    fn after_update_requires_full_rollout() {
        let mut buffer = small_buffer();
        assert_eq!(
            buffer.after_update(),
            Err(BufferError::IncompleteRollout {
                inserted: 0,
                expected: 3,
            })
        );
    }

    #[test]
    fn after_update_round_trips_every_rotated_field() {
        let mut buffer = small_buffer();
        let cells = buffer.n_envs * buffer.n_agents;
        for i in 0..3 {
            let mut record = filled_record(&buffer, i as f32 + 1.0, vec![1.0; cells]);
            record.bad_masks = Some(vec![if i == 2 { 0.0 } else { 1.0 }; cells]);
            record.active_masks = Some(vec![0.5; cells]);
            buffer.insert(&record).unwrap();
        }

        let last = buffer.episode_length;
        let expected_share_obs = buffer.share_obs_step(last).to_vec();
        let expected_obs = buffer.obs_step(last).to_vec();
        let expected_rnn = buffer.rnn_states_step(last).to_vec();
        let expected_rnn_critic = buffer.rnn_states_critic_step(last).to_vec();
        let expected_masks = buffer.masks_step(last).to_vec();
        let expected_active = buffer.active_masks_step(last).to_vec();
        let expected_avail = buffer.available_actions_step(last).unwrap().to_vec();
        let expected_bad = slot(&buffer.bad_masks, last, cells).to_vec();

        buffer.after_update().unwrap();
        assert_eq!(buffer.step(), 0);
        assert_eq!(buffer.share_obs_step(0), &expected_share_obs[..]);
        assert_eq!(buffer.obs_step(0), &expected_obs[..]);
        assert_eq!(buffer.rnn_states_step(0), &expected_rnn[..]);
        assert_eq!(buffer.rnn_states_critic_step(0), &expected_rnn_critic[..]);
        assert_eq!(buffer.masks_step(0), &expected_masks[..]);
        assert_eq!(buffer.active_masks_step(0), &expected_active[..]);
        assert_eq!(buffer.available_actions_step(0).unwrap(), &expected_avail[..]);
        assert_eq!(slot(&buffer.bad_masks, 0, cells), &expected_bad[..]);
    }

    #[test]
    fn choose_insert_writes_only_the_acting_agent() {
        let mut buffer = small_buffer();
        buffer
            .seed_initial(
                &vec![9.0; 2 * 2 * 3],
                &vec![9.0; 2 * 2 * 2],
                Some(&vec![1.0; 2 * 2 * 5]),
            )
            .unwrap();

        let record = TurnRecord {
            agent_turn: vec![0, 1],
            share_obs: vec![5.0; 2 * 3],
            obs: vec![5.0; 2 * 2],
            rnn_states: vec![5.0; 2 * 4],
            rnn_states_critic: vec![5.0; 2 * 4],
            actions: vec![2.0; 2],
            action_log_probs: vec![-1.0; 2],
            value_preds: vec![0.25; 2],
            rewards: vec![1.0; 2],
            masks: vec![1.0; 2],
            bad_masks: None,
            available_actions: Some(vec![1.0; 2 * 5]),
        };
        buffer.choose_insert(&record).unwrap();
        assert_eq!(buffer.step(), 1);

        let obs = buffer.obs_step(1);
        // env 0: agent 0 acted, agent 1 carried forward from slot 0.
        assert_eq!(&obs[0..2], &[5.0, 5.0]);
        assert_eq!(&obs[2..4], &[9.0, 9.0]);
        // env 1: agent 1 acted, agent 0 carried forward.
        assert_eq!(&obs[4..6], &[9.0, 9.0]);
        assert_eq!(&obs[6..8], &[5.0, 5.0]);

        let actions = buffer.actions_step(0);
        assert_eq!(actions[0], 2.0); // env 0, agent 0
        assert_eq!(actions[1], 0.0); // env 0, agent 1 untouched
        assert_eq!(actions[2], 0.0); // env 1, agent 0 untouched
        assert_eq!(actions[3], 2.0); // env 1, agent 1
    }

    #[test]
    fn compute_returns_requires_full_rollout() {
        let mut buffer = small_buffer();
        let config = small_config();
        let next_value = vec![0.0; 4];
        assert_eq!(
            buffer.compute_returns(&next_value, &config, None),
            Err(BufferError::IncompleteRollout {
                inserted: 0,
                expected: 3,
            })
        );
    }
}
