//! The signal/trajectory data model and the `Network` trait, the sole
//! interface to the network implementation (owned elsewhere, outside this
//! crate).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::tensor::{cat_rows, Tensor};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntSignalSpec {
    pub num_values: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FloatSignalSpec {
    pub min: f32,
    pub max: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SignalSpec {
    Int(IntSignalSpec),
    Float(FloatSignalSpec),
}

pub type SignalSpecMap = BTreeMap<String, SignalSpec>;

/// Validate the action-interface invariant: every action spec is integer
/// with scalar cardinality (shape `[1]` per step).
pub fn validate_action_spec_map(actions: &SignalSpecMap) -> Result<()> {
    if actions.contains_key("critic") {
        return Err(CoreError::ConfigError {
            reason: "action spec map must not contain the reserved key 'critic'".to_string(),
        });
    }
    for (name, spec) in actions {
        if !matches!(spec, SignalSpec::Int(_)) {
            return Err(CoreError::ConfigError {
                reason: format!("action '{name}' must have an integer spec"),
            });
        }
    }
    Ok(())
}

/// `(state0, actions, reward, state1, terminal)` produced per environment
/// step.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub state0: BTreeMap<String, Tensor>,
    pub actions: BTreeMap<String, i32>,
    pub reward: f32,
    pub state1: BTreeMap<String, Tensor>,
    pub terminal: bool,
}

/// Ordered sequence of `ExecutionResult`, appended in temporal order.
#[derive(Clone, Debug, Default)]
pub struct Trajectory(pub Vec<ExecutionResult>);

/// Columnar form of a trajectory: `states` has `n+1` rows (row `i` is
/// `state0` of step `i`, row `n` is `state1` of the last step), `actions`
/// has `n` rows, `rewards` has `n` rows.
pub struct Columnized {
    pub states: BTreeMap<String, Tensor>,
    pub actions: BTreeMap<String, Tensor>,
    pub rewards: Tensor,
    pub terminal: Vec<bool>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, result: ExecutionResult) {
        self.0.push(result);
    }

    pub fn columnize(&self) -> Columnized {
        let n = self.0.len();
        assert!(n > 0, "cannot columnize an empty trajectory");

        let state_names: Vec<&String> = self.0[0].state0.keys().collect();
        let mut states: BTreeMap<String, Tensor> = BTreeMap::new();
        for name in &state_names {
            let mut rows: Vec<Tensor> = self.0.iter().map(|r| r.state0[*name].clone()).collect();
            rows.push(self.0[n - 1].state1[*name].clone());
            states.insert((*name).clone(), cat_rows(&rows));
        }

        let action_names: Vec<&String> = self.0[0].actions.keys().collect();
        let mut actions: BTreeMap<String, Tensor> = BTreeMap::new();
        for name in &action_names {
            let values: Vec<f32> = self.0.iter().map(|r| r.actions[*name] as f32).collect();
            actions.insert((*name).clone(), Tensor::scalar_column(&values));
        }

        let rewards: Vec<f32> = self.0.iter().map(|r| r.reward).collect();
        let terminal: Vec<bool> = self.0.iter().map(|r| r.terminal).collect();

        Columnized {
            states,
            actions,
            rewards: Tensor::scalar_column(&rewards),
            terminal,
        }
    }
}

/// Output of a forward pass: one probability (or logit, depending on the
/// network) row per policy head, plus the critic's scalar value estimate.
pub struct NetworkOutput {
    pub policy: BTreeMap<String, Tensor>,
    pub critic: Tensor,
}

/// The sole interface to the excluded neural-network implementation. The
/// core never constructs a concrete backend; it only consumes this trait.
pub trait Network: Send {
    /// Forward `states` (shape `[rows, ...]` per input signal is implied by
    /// the network's own input spec) and return policy + critic outputs.
    /// `training` selects training-mode behavior (e.g. dropout) vs. eval.
    fn forward(
        &self,
        states: &BTreeMap<String, Tensor>,
        training: bool,
    ) -> Result<NetworkOutput>;

    /// Apply gradients per head (including `"critic"`) scaled by the
    /// caller, together with the per-step delta signal and `lambda`.
    fn train(
        &mut self,
        grads: BTreeMap<String, Tensor>,
        delta_signal: &Tensor,
        lambda: f32,
    ) -> Result<()>;

    /// Cardinality of a named policy head's output, or `None` if the
    /// network exposes no such head.
    fn head_cardinality(&self, head: &str) -> Option<usize>;

    /// Reinitialize parameters deterministically given `seed`.
    fn init(&mut self, seed: u64);

    /// Opaque topology descriptor embedded in the agent.yml JSON.
    fn topology_json(&self) -> serde_json::Value;

    /// Serialize parameters as named ND arrays for `agent.bin`.
    fn into_named_arrays(&self) -> Vec<(String, Tensor)>;

    /// Restore parameters from named ND arrays read from `agent.bin`.
    fn load_named_arrays(&mut self, arrays: Vec<(String, Tensor)>) -> Result<()>;
}
