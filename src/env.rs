//! Environment collaborator boundary.
//!
//! The core drives a batch of parallel environments through this trait.
//! All arrays are flat with explicit `[n_envs × n_agents × dim]` layout;
//! the implementor owns worker fan-out and blocks `step` until the
//! slowest worker has answered. A worker crash surfaces as [`EnvError`]
//! and aborts the run.

use std::collections::HashMap;

use crate::error::EnvError;
use crate::spaces::ActionSpace;

/// Per-(env, agent) step metadata.
#[derive(Debug, Clone, Default)]
pub struct StepInfo {
    /// True when the episode ended because of an artificial time limit
    /// rather than a true terminal state.
    pub bad_transition: bool,
    /// Domain scalars (e.g. `battles_won`) consumed only by metrics.
    pub episode_scalars: HashMap<String, f64>,
}

/// Output of [`VectorEnv::reset`].
#[derive(Debug, Clone)]
pub struct EnvReset {
    /// Agent observations, `[n_envs × n_agents × obs_dim]`.
    pub obs: Vec<f32>,
    /// Centralized observations, `[n_envs × n_agents × share_obs_dim]`.
    pub share_obs: Vec<f32>,
    /// Legal-action masks, `[n_envs × n_agents × n_actions]`; empty when
    /// the action space has no masking.
    pub available_actions: Vec<f32>,
}

/// Output of [`VectorEnv::step`].
#[derive(Debug, Clone)]
pub struct EnvStep {
    /// Agent observations after the step, `[n_envs × n_agents × obs_dim]`.
    pub obs: Vec<f32>,
    /// Centralized observations, `[n_envs × n_agents × share_obs_dim]`.
    pub share_obs: Vec<f32>,
    /// Per-(env, agent) scalar rewards, `[n_envs × n_agents]`.
    pub rewards: Vec<f32>,
    /// Per-(env, agent) terminal flags, `[n_envs × n_agents]`.
    pub dones: Vec<bool>,
    /// Per-(env, agent) metadata, `[n_envs × n_agents]`.
    pub infos: Vec<StepInfo>,
    /// Legal-action masks, `[n_envs × n_agents × n_actions]`; empty when unused.
    pub available_actions: Vec<f32>,
}

/// A synchronous batch of parallel multi-agent environments.
///
/// Environments are expected to auto-reset: when an episode terminates,
/// the observation returned for that environment is the first observation
/// of the next episode.
pub trait VectorEnv {
    /// Resets every environment and returns the initial observations.
    fn reset(&mut self) -> Result<EnvReset, EnvError>;

    /// Steps every environment with one action row per (env, agent).
    ///
    /// `actions` is `[n_envs × n_agents]` rows of discrete indices, one
    /// row per agent, already rearranged from policy output.
    fn step(&mut self, actions: &[Vec<i64>]) -> Result<EnvStep, EnvError>;

    /// Number of parallel environments.
    fn n_envs(&self) -> usize;
    /// Number of agents per environment.
    fn n_agents(&self) -> usize;
    /// Per-agent observation width.
    fn obs_dim(&self) -> usize;
    /// Centralized observation width.
    fn share_obs_dim(&self) -> usize;
    /// The per-agent action space.
    fn action_space(&self) -> ActionSpace;
}
