//! Return estimation: GAE-λ and plain n-step discounting.
//!
//! Both estimators run backward over one (env, agent) time series in
//! denormalized value space; the buffer extracts series, applies PopArt
//! denormalization, and scatters the results back. Masks break the
//! recursion at true terminals; bad masks suppress bootstrapping across
//! artificial time-limit truncations.

/// GAE-λ returns for one series.
///
/// `rewards` has `T` entries; `values`, `masks`, and `bad_masks` have
/// `T + 1` (the final slot holds the bootstrap value and the carry-over
/// masks). With `proper_time_limits`, a `bad_masks[t + 1] == 0` boundary
/// zeroes the accumulated advantage so `returns[t] == values[t]` exactly.
pub fn gae_returns(
    rewards: &[f32],
    values: &[f32],
    masks: &[f32],
    bad_masks: &[f32],
    gamma: f32,
    lambda: f32,
    proper_time_limits: bool,
) -> Vec<f32> {
    let steps = rewards.len();
    debug_assert_eq!(values.len(), steps + 1);
    debug_assert_eq!(masks.len(), steps + 1);
    debug_assert_eq!(bad_masks.len(), steps + 1);

    let mut returns = vec![0.0; steps];
    let mut gae = 0.0f32;
    for t in (0..steps).rev() {
        let delta = rewards[t] + gamma * values[t + 1] * masks[t + 1] - values[t];
        gae = delta + gamma * lambda * masks[t + 1] * gae;
        if proper_time_limits {
            gae *= bad_masks[t + 1];
        }
        returns[t] = gae + values[t];
    }
    returns
}

/// N-step discounted returns for one series, seeded from `bootstrap`.
///
/// With `proper_time_limits`, a truncated boundary blends the return
/// back to the raw value estimate instead of propagating the bootstrap.
pub fn discounted_returns(
    rewards: &[f32],
    values: &[f32],
    masks: &[f32],
    bad_masks: &[f32],
    gamma: f32,
    proper_time_limits: bool,
    bootstrap: f32,
) -> Vec<f32> {
    let steps = rewards.len();
    debug_assert_eq!(values.len(), steps + 1);
    debug_assert_eq!(masks.len(), steps + 1);
    debug_assert_eq!(bad_masks.len(), steps + 1);

    let mut returns = vec![0.0; steps + 1];
    returns[steps] = bootstrap;
    for t in (0..steps).rev() {
        let ret = returns[t + 1] * gamma * masks[t + 1] + rewards[t];
        returns[t] = if proper_time_limits {
            let bad = bad_masks[t + 1];
            ret * bad + (1.0 - bad) * values[t]
        } else {
            ret
        };
    }
    returns.truncate(steps);
    returns
}
