//! Differential average-reward TD error and n-step advantage estimation
//! for the PPO path.

use crate::error::{CoreError, Result};
use crate::tensor::Tensor;

/// Per-step TD error under the differential average-reward formulation,
/// computed sequentially since `R` must be updated after each step before
/// the next delta is computed.
#[derive(Debug)]
pub struct TdResult {
    pub deltas: Vec<f32>,
    /// `avg_rewards[t]` is `R` as it stood *before* step `t`'s update — the
    /// value `delta[t]` was actually computed against, not the value `R`
    /// takes on after folding `delta[t]` in.
    pub avg_rewards: Vec<f32>,
    pub final_avg_reward: f32,
}

/// `rewards[t]`, `values[t]` for `t in 0..=n` (length `n+1`), running
/// average reward seeded at `initial_avg_reward`, step size `reward_alpha`.
/// `terminal[t]` (optional, length `n`) zeroes the `v(t+1) - v(t)` bootstrap
/// term at terminal steps.
pub fn td_errors(
    rewards: &[f32],
    values: &[f32],
    initial_avg_reward: f32,
    reward_alpha: f32,
    terminal: Option<&[bool]>,
) -> Result<TdResult> {
    let n = rewards.len();
    if n == 0 {
        return Err(CoreError::BatchEmpty);
    }
    if values.len() != n + 1 {
        return Err(CoreError::ConfigError {
            reason: format!(
                "td_errors expects {} values for {} rewards, got {}",
                n + 1,
                n,
                values.len()
            ),
        });
    }

    let mut r = initial_avg_reward;
    let mut deltas = Vec::with_capacity(n);
    let mut avg_rewards = Vec::with_capacity(n);

    for t in 0..n {
        let is_terminal = terminal.map(|flags| flags[t]).unwrap_or(false);
        let bootstrap = if is_terminal {
            0.0
        } else {
            values[t + 1] - values[t]
        };
        let delta = rewards[t] - r + bootstrap;
        avg_rewards.push(r);
        r += reward_alpha * delta;
        deltas.push(delta);
    }

    Ok(TdResult {
        deltas,
        avg_rewards,
        final_avg_reward: r,
    })
}

/// n-step advantage artifact for the PPO path.
#[derive(Debug)]
pub struct Advantage {
    pub dr: Vec<f32>,
    pub dv: Vec<f32>,
    pub deltas: Vec<f32>,
    pub avg_rewards: Vec<f32>,
    pub final_avg_reward: f32,
    pub advantages: Vec<f32>,
}

/// Compute `A(t) = sum_{i=t..n-1}[r(i) - R(i)] + v(t) - v(n)` by reverse
/// cumulative sum of `r - R`, then adding `v(t) - v(n)`.
pub fn n_step_advantage(
    rewards: &[f32],
    values: &[f32],
    initial_avg_reward: f32,
    reward_alpha: f32,
    terminal: Option<&[bool]>,
) -> Result<Advantage> {
    let n = rewards.len();
    if n == 0 {
        return Err(CoreError::BatchEmpty);
    }

    let td = td_errors(rewards, values, initial_avg_reward, reward_alpha, terminal)?;

    let dr: Vec<f32> = rewards
        .iter()
        .zip(td.avg_rewards.iter())
        .map(|(r, avg)| r - avg)
        .collect();
    let dv: Vec<f32> = (0..n).map(|t| values[t] - values[t + 1]).collect();

    let mut reverse_cumsum = vec![0.0f32; n];
    let mut running = 0.0f32;
    for t in (0..n).rev() {
        running += dr[t];
        reverse_cumsum[t] = running;
    }

    let v_n = values[n];
    let advantages: Vec<f32> = (0..n).map(|t| reverse_cumsum[t] + values[t] - v_n).collect();

    Ok(Advantage {
        dr,
        dv,
        deltas: td.deltas,
        avg_rewards: td.avg_rewards,
        final_avg_reward: td.final_avg_reward,
        advantages,
    })
}

pub fn to_column(values: &[f32]) -> Tensor {
    Tensor::scalar_column(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn td_errors_match_hand_worked_sequence() {
        let rewards = [1.0, 1.0, 1.0];
        let values = [0.5, 0.5, 0.5, 0.5];
        let result = td_errors(&rewards, &values, 0.0, 0.1, None).unwrap();
        let expected_deltas = [1.0, 0.9, 0.81];
        for (got, want) in result.deltas.iter().zip(expected_deltas.iter()) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
        assert!((result.final_avg_reward - 0.271).abs() < 1e-6);
    }

    #[test]
    fn n_step_advantage_matches_hand_worked_sequence() {
        let rewards = [1.0, 2.0, 3.0];
        let values = [0.0, 0.0, 0.0, 0.0];
        let adv = n_step_advantage(&rewards, &values, 0.0, 0.0, None).unwrap();
        assert_eq!(adv.advantages, vec![6.0, 5.0, 3.0]);
    }

    #[test]
    fn empty_batch_rejected() {
        let err = td_errors(&[], &[0.0], 0.0, 0.1, None).unwrap_err();
        assert!(matches!(err, CoreError::BatchEmpty));
        let err = n_step_advantage(&[], &[0.0], 0.0, 0.1, None).unwrap_err();
        assert!(matches!(err, CoreError::BatchEmpty));
    }

    #[test]
    fn delta_equals_dr_minus_dv_with_nonzero_reward_alpha() {
        let rewards = [1.0, 1.0, 1.0];
        let values = [0.5, 0.5, 0.5, 0.5];
        let adv = n_step_advantage(&rewards, &values, 0.0, 0.1, None).unwrap();
        for t in 0..rewards.len() {
            let identity = adv.dr[t] - adv.dv[t];
            assert!(
                (identity - adv.deltas[t]).abs() < 1e-6,
                "t={t}: dr-dv={identity} but delta={}",
                adv.deltas[t]
            );
        }
        // pre-update R series for alpha=0.1, R0=0 is [0, 0.1, 0.19].
        let expected_avg_rewards = [0.0, 0.1, 0.19];
        for (got, want) in adv.avg_rewards.iter().zip(expected_avg_rewards.iter()) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn terminal_zeroes_bootstrap() {
        let rewards = [1.0, 1.0];
        let values = [0.0, 5.0, 5.0];
        let with_terminal = td_errors(&rewards, &values, 0.0, 0.1, Some(&[true, false])).unwrap();
        // t=0 terminal: delta = r - R = 1.0, no bootstrap from v(1)-v(0)=5.0
        assert!((with_terminal.deltas[0] - 1.0).abs() < 1e-6);
    }
}
