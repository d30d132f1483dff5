//! Minibatch generation over a full rollout.
//!
//! Three interchangeable sampling strategies reshape the buffer into
//! training batches. One generator call produces one epoch over the
//! data: the yielded batches partition the transition set, covering
//! every transition exactly once. Every batch keeps its fields aligned
//! by sample index and carries explicit `seq_len`/`n_seqs` shape
//! metadata instead of relying on implicit broadcasting.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::{ConfigError, TrainError};
use crate::storage::buffer::RolloutBuffer;

/// One training minibatch.
///
/// Data is laid out time-major: row `dt * n_seqs + s` holds sequence
/// `s` at offset `dt` within the chunk. Feed-forward batches have
/// `seq_len == 1`, so rows are independent samples. The recurrent-state
/// fields hold one row per sequence: the state at the sequence (or
/// chunk) start.
#[derive(Debug, Clone)]
pub struct MiniBatch {
    pub seq_len: usize,
    pub n_seqs: usize,
    pub share_obs: Vec<f32>,
    pub obs: Vec<f32>,
    pub rnn_states: Vec<f32>,
    pub rnn_states_critic: Vec<f32>,
    pub actions: Vec<f32>,
    pub value_preds: Vec<f32>,
    pub returns: Vec<f32>,
    pub masks: Vec<f32>,
    pub active_masks: Vec<f32>,
    pub old_action_log_probs: Vec<f32>,
    pub advantages: Vec<f32>,
    pub available_actions: Option<Vec<f32>>,
}

impl MiniBatch {
    /// Number of flat transition rows in the batch.
    pub fn len(&self) -> usize {
        self.seq_len * self.n_seqs
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `ids` into `num_mini_batch` near-equal groups; the last group
/// absorbs the remainder.
fn split_groups(ids: Vec<usize>, num_mini_batch: usize) -> Result<Vec<Vec<usize>>, ConfigError> {
    let base = ids.len() / num_mini_batch;
    if base == 0 {
        return Err(ConfigError::TooFewSamples {
            samples: ids.len(),
            num_mini_batch,
        });
    }
    let mut groups = Vec::with_capacity(num_mini_batch);
    let mut start = 0;
    for i in 0..num_mini_batch {
        let end = if i + 1 == num_mini_batch {
            ids.len()
        } else {
            start + base
        };
        groups.push(ids[start..end].to_vec());
        start = end;
    }
    Ok(groups)
}

fn gather_rows(src: &[f32], width: usize, rows: &[usize], out: &mut Vec<f32>) {
    for &row in rows {
        out.extend_from_slice(&src[row * width..(row + 1) * width]);
    }
}

impl RolloutBuffer {
    /// Builds one batch from time-major transition rows plus per-sequence
    /// recurrent-state rows.
    fn batch_from_rows(
        &self,
        advantages: &[f32],
        seq_len: usize,
        rows: &[usize],
        rnn_rows: &[usize],
    ) -> MiniBatch {
        let n_seqs = rnn_rows.len();
        let mut batch = MiniBatch {
            seq_len,
            n_seqs,
            share_obs: Vec::with_capacity(rows.len() * self.share_obs_dim),
            obs: Vec::with_capacity(rows.len() * self.obs_dim),
            rnn_states: Vec::with_capacity(n_seqs * self.recurrent_dim),
            rnn_states_critic: Vec::with_capacity(n_seqs * self.recurrent_dim),
            actions: Vec::with_capacity(rows.len() * self.act_dim),
            value_preds: Vec::with_capacity(rows.len()),
            returns: Vec::with_capacity(rows.len()),
            masks: Vec::with_capacity(rows.len()),
            active_masks: Vec::with_capacity(rows.len()),
            old_action_log_probs: Vec::with_capacity(rows.len()),
            advantages: Vec::with_capacity(rows.len()),
            available_actions: None,
        };
        gather_rows(&self.share_obs, self.share_obs_dim, rows, &mut batch.share_obs);
        gather_rows(&self.obs, self.obs_dim, rows, &mut batch.obs);
        gather_rows(&self.rnn_states, self.recurrent_dim, rnn_rows, &mut batch.rnn_states);
        gather_rows(
            &self.rnn_states_critic,
            self.recurrent_dim,
            rnn_rows,
            &mut batch.rnn_states_critic,
        );
        gather_rows(&self.actions, self.act_dim, rows, &mut batch.actions);
        gather_rows(&self.value_preds, 1, rows, &mut batch.value_preds);
        gather_rows(&self.returns, 1, rows, &mut batch.returns);
        gather_rows(&self.masks, 1, rows, &mut batch.masks);
        gather_rows(&self.active_masks, 1, rows, &mut batch.active_masks);
        gather_rows(&self.action_log_probs, 1, rows, &mut batch.old_action_log_probs);
        gather_rows(advantages, 1, rows, &mut batch.advantages);
        if self.n_actions > 0 {
            let mut avail = Vec::with_capacity(rows.len() * self.n_actions);
            gather_rows(&self.available_actions, self.n_actions, rows, &mut avail);
            batch.available_actions = Some(avail);
        }
        batch
    }

    fn check_advantages(&self, advantages: &[f32]) -> Result<(), TrainError> {
        let expected = self.episode_length * self.n_envs * self.n_agents;
        if advantages.len() != expected {
            return Err(crate::error::BufferError::ShapeMismatch {
                field: "advantages",
                expected,
                got: advantages.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Shuffled independent transitions for memory-less policies.
    ///
    /// Flattens the `(time × env × agent)` index space into one pool,
    /// shuffles it, and slices it into `num_mini_batch` near-equal
    /// chunks (the last chunk absorbs the remainder).
    pub fn feed_forward_generator(
        &self,
        advantages: &[f32],
        num_mini_batch: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<MiniBatch>, TrainError> {
        self.check_advantages(advantages)?;
        let total = self.episode_length * self.n_envs * self.n_agents;
        let mut ids: Vec<usize> = (0..total).collect();
        ids.shuffle(rng);
        let groups = split_groups(ids, num_mini_batch)?;
        Ok(groups
            .into_iter()
            .map(|rows| self.batch_from_rows(advantages, 1, &rows, &rows))
            .collect())
    }

    /// Whole `(env, agent)` sequences for recurrent policies processed
    /// over full rollout length.
    ///
    /// Shuffles at sequence granularity; within a batch, sequences are
    /// stacked and the time axis is flattened time-major. Recurrent
    /// states hold the sequence-start state.
    pub fn naive_recurrent_generator(
        &self,
        advantages: &[f32],
        num_mini_batch: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<MiniBatch>, TrainError> {
        self.check_advantages(advantages)?;
        let cells = self.n_envs * self.n_agents;
        let mut seq_ids: Vec<usize> = (0..cells).collect();
        seq_ids.shuffle(rng);
        let groups = split_groups(seq_ids, num_mini_batch)?;

        Ok(groups
            .into_iter()
            .map(|group| {
                let mut rows = Vec::with_capacity(self.episode_length * group.len());
                for t in 0..self.episode_length {
                    for &c in &group {
                        rows.push(t * cells + c);
                    }
                }
                // Sequence starts at slot 0.
                self.batch_from_rows(advantages, self.episode_length, &rows, &group)
            })
            .collect())
    }

    /// Fixed-length sequence chunks for recurrent policies with bounded
    /// backpropagation-through-time.
    ///
    /// Requires `episode_length % data_chunk_length == 0`; chunks are
    /// shuffled across the full `(env × agent × chunk)` space. Recurrent
    /// states hold the chunk-start state.
    pub fn recurrent_generator(
        &self,
        advantages: &[f32],
        num_mini_batch: usize,
        data_chunk_length: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<MiniBatch>, TrainError> {
        self.check_advantages(advantages)?;
        if data_chunk_length == 0 {
            return Err(ConfigError::NonPositive {
                field: "data_chunk_length",
            }
            .into());
        }
        if self.episode_length % data_chunk_length != 0 {
            return Err(ConfigError::ChunkLengthMismatch {
                episode_length: self.episode_length,
                data_chunk_length,
            }
            .into());
        }
        let cells = self.n_envs * self.n_agents;
        let pieces = self.episode_length / data_chunk_length;
        let mut chunk_ids: Vec<usize> = (0..pieces * cells).collect();
        chunk_ids.shuffle(rng);
        let groups = split_groups(chunk_ids, num_mini_batch)?;

        Ok(groups
            .into_iter()
            .map(|group| {
                let mut rows = Vec::with_capacity(data_chunk_length * group.len());
                let mut rnn_rows = Vec::with_capacity(group.len());
                for dt in 0..data_chunk_length {
                    for &k in &group {
                        let c = k / pieces;
                        let t0 = (k % pieces) * data_chunk_length;
                        rows.push((t0 + dt) * cells + c);
                    }
                }
                for &k in &group {
                    let c = k / pieces;
                    let t0 = (k % pieces) * data_chunk_length;
                    rnn_rows.push(t0 * cells + c);
                }
                self.batch_from_rows(advantages, data_chunk_length, &rows, &rnn_rows)
            })
            .collect())
    }
}
