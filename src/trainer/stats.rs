//! Aggregated statistics for one training call.

/// Sums of per-minibatch statistics, averaged by [`TrainStats::finalize`].
///
/// Policy-phase fields are divided by `ppo_epoch × num_mini_batch`;
/// auxiliary-phase fields by `aux_epoch × num_mini_batch`. The two
/// denominators are deliberately separate.
#[derive(Debug, Clone, Default)]
pub struct TrainStats {
    pub value_loss: f64,
    pub action_loss: f64,
    pub dist_entropy: f64,
    pub actor_grad_norm: f64,
    pub critic_grad_norm: f64,
    /// Mean importance ratio across minibatches.
    pub ratio: f64,
    pub kl_loss: f64,
    pub joint_loss: f64,
    pub joint_grad_norm: f64,
}

impl TrainStats {
    /// Divides policy-phase sums by `policy_updates` and auxiliary-phase
    /// sums by `aux_updates` (0 means no auxiliary phase ran).
    pub fn finalize(&mut self, policy_updates: usize, aux_updates: usize) {
        if policy_updates > 0 {
            let n = policy_updates as f64;
            self.value_loss /= n;
            self.action_loss /= n;
            self.dist_entropy /= n;
            self.actor_grad_norm /= n;
            self.critic_grad_norm /= n;
            self.ratio /= n;
            self.kl_loss /= n;
        }
        if aux_updates > 0 {
            let n = aux_updates as f64;
            self.joint_loss /= n;
            self.joint_grad_norm /= n;
        }
    }

    /// Name/value pairs for metrics emission.
    pub fn entries(&self) -> [(&'static str, f64); 9] {
        [
            ("value_loss", self.value_loss),
            ("action_loss", self.action_loss),
            ("dist_entropy", self.dist_entropy),
            ("actor_grad_norm", self.actor_grad_norm),
            ("critic_grad_norm", self.critic_grad_norm),
            ("ratio", self.ratio),
            ("kl_loss", self.kl_loss),
            ("joint_loss", self.joint_loss),
            ("joint_grad_norm", self.joint_grad_norm),
        ]
    }
}
