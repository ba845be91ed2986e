//! The stateful learner: holds the `Network` handle, the trajectory
//! buffer, and hyperparameters; exposes `act`, `observe`,
//! `train_by_trajectory`, `init`, `save`, `backup`. Two variants
//! (`TdSingleNn`, `Ppo`) share this record rather than a deep inheritance
//! hierarchy: the variant only changes which batch training kernel
//! `train_batch` dispatches to.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::advantage::{n_step_advantage, td_errors};
use crate::error::{CoreError, Result};
use crate::kpi::{KpiEvent, KpiPublisher};
use crate::processor::{IdentityProcessor, Processor};
use crate::spec::{
    validate_action_spec_map, IntSignalSpec, Network, NetworkOutput, SignalSpec, SignalSpecMap,
    Trajectory,
};
use crate::tensor::Tensor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentVariant {
    TdSingleNn,
    Ppo,
}

/// Hyperparameters and specs that round-trip through `agent.yml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentDescriptor {
    #[serde(rename = "rewardAlpha")]
    pub reward_alpha: f32,
    pub eta: f32,
    pub lambda: f32,
    #[serde(rename = "numSteps")]
    pub num_steps: usize,
    #[serde(rename = "numEpochs")]
    pub num_epochs: usize,
    #[serde(rename = "batchSize")]
    pub batch_size: usize,
    #[serde(rename = "ppoEpsilon", skip_serializing_if = "Option::is_none")]
    pub ppo_epsilon: Option<f32>,
    pub alphas: BTreeMap<String, f32>,
    pub state: SignalSpecMap,
    pub actions: SignalSpecMap,
    pub network: serde_json::Value,
    #[serde(rename = "inputProcess", skip_serializing_if = "Option::is_none")]
    pub input_process: Option<serde_json::Value>,
}

/// Construction parameters for `Agent::new`.
pub struct AgentConfig {
    pub variant: AgentVariant,
    pub state_spec: SignalSpecMap,
    pub action_spec: SignalSpecMap,
    pub reward_alpha: f32,
    pub eta: f32,
    pub alphas: BTreeMap<String, f32>,
    pub lambda: f32,
    pub num_steps: usize,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub ppo_epsilon: f32,
    pub model_path: PathBuf,
    pub seed: u64,
    pub processor: Option<Box<dyn Processor>>,
    /// When true, `observe` trains automatically once the trajectory buffer
    /// reaches `num_steps`, standing in for the online/asynchronous path;
    /// when false, callers must invoke `train_by_trajectory` themselves.
    pub train_online: bool,
}

pub struct Agent<N: Network> {
    variant: AgentVariant,
    state_spec: SignalSpecMap,
    action_spec: SignalSpecMap,
    avg_reward: f32,
    reward_alpha: f32,
    eta: f32,
    alphas: BTreeMap<String, f32>,
    lambda: f32,
    num_steps: usize,
    num_epochs: usize,
    batch_size: usize,
    ppo_epsilon: f32,
    network: N,
    trajectory: Trajectory,
    processor: Box<dyn Processor>,
    rng: SmallRng,
    model_path: PathBuf,
    has_backed_up: bool,
    kpi: KpiPublisher,
    train_online: bool,
    /// Bumped after every successful `train_by_trajectory` call. Stands in
    /// for the commit point an asynchronous trainer's merge/CAS step would
    /// guard: `Network` carries no `Clone` bound, so a literal
    /// duplicate-agent-and-merge isn't generically possible here, and
    /// training runs in place instead.
    train_generation: u64,
}

impl<N: Network> std::fmt::Debug for Agent<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").finish_non_exhaustive()
    }
}

impl<N: Network> Agent<N> {
    pub fn new(network: N, config: AgentConfig) -> Result<Self> {
        validate_action_spec_map(&config.action_spec)?;
        if config.alphas.contains_key("critic") == false {
            return Err(CoreError::ConfigError {
                reason: "alphas must include the key 'critic'".to_string(),
            });
        }
        for name in config.action_spec.keys() {
            if !config.alphas.contains_key(name) {
                return Err(CoreError::ConfigError {
                    reason: format!("alphas is missing entry for action head '{name}'"),
                });
            }
        }
        for (name, alpha) in &config.alphas {
            if *alpha <= 0.0 {
                return Err(CoreError::ConfigError {
                    reason: format!("alphas['{name}'] must be > 0, got {alpha}"),
                });
            }
        }
        if !(config.reward_alpha > 0.0 && config.reward_alpha <= 1.0) {
            return Err(CoreError::ConfigError {
                reason: "reward_alpha must be in (0, 1]".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&config.lambda) {
            return Err(CoreError::ConfigError {
                reason: "lambda must be in [0, 1]".to_string(),
            });
        }
        if !(config.ppo_epsilon > 0.0 && config.ppo_epsilon < 1.0) {
            return Err(CoreError::ConfigError {
                reason: "ppo_epsilon must be in (0, 1)".to_string(),
            });
        }
        if config.eta <= 0.0 {
            return Err(CoreError::ConfigError {
                reason: "eta must be > 0".to_string(),
            });
        }
        for (name, spec) in &config.action_spec {
            let IntSignalSpec { num_values } = match spec {
                SignalSpec::Int(s) => s,
                _ => unreachable!("validated above"),
            };
            match network.head_cardinality(name) {
                Some(k) if k == *num_values => {}
                Some(k) => {
                    return Err(CoreError::ConfigError {
                        reason: format!(
                            "network head '{name}' has cardinality {k}, expected {num_values}"
                        ),
                    })
                }
                None => {
                    return Err(CoreError::ConfigError {
                        reason: format!("network exposes no output head named '{name}'"),
                    })
                }
            }
        }

        let processor = config
            .processor
            .unwrap_or_else(|| Box::new(IdentityProcessor::new(config.state_spec.clone())));

        let variant = config.variant;
        let agent = Self {
            variant,
            state_spec: config.state_spec,
            action_spec: config.action_spec,
            avg_reward: 0.0,
            reward_alpha: config.reward_alpha,
            eta: config.eta,
            alphas: config.alphas,
            lambda: config.lambda,
            num_steps: config.num_steps,
            num_epochs: config.num_epochs,
            batch_size: config.batch_size,
            ppo_epsilon: config.ppo_epsilon,
            network,
            trajectory: Trajectory::default(),
            processor,
            rng: SmallRng::seed_from_u64(config.seed),
            model_path: config.model_path,
            has_backed_up: false,
            kpi: KpiPublisher::new(crate::kpi::DEFAULT_CAPACITY),
            train_online: config.train_online,
            train_generation: 0,
        };
        log::info!(
            "agent constructed: variant={variant:?} train_online={}",
            agent.train_online
        );
        Ok(agent)
    }

    /// Number of successful `train_by_trajectory` calls this agent has
    /// completed; the synchronous stand-in for an async merge generation.
    pub fn train_generation(&self) -> u64 {
        self.train_generation
    }

    pub fn kpi_subscriber(&self) -> crate::kpi::KpiSubscriber {
        self.kpi.subscribe()
    }

    /// Read-only access to the owned network, used by `BatchTrainer` to
    /// query head cardinalities when preparing action masks.
    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn avg_reward(&self) -> f32 {
        self.avg_reward
    }

    pub fn trajectory_len(&self) -> usize {
        self.trajectory.len()
    }

    pub fn is_ready_for_train(&self) -> bool {
        self.trajectory.len() >= self.num_steps
    }

    /// Project `state` through the processor, forward once in eval mode,
    /// and sample an action per head by inverse-CDF against a uniform
    /// draw (tie-break: last index).
    pub fn act(&mut self, state: &BTreeMap<String, Tensor>) -> Result<BTreeMap<String, i32>> {
        let processed = self.processor.apply(state);
        let batched: BTreeMap<String, Tensor> = processed
            .into_iter()
            .map(|(k, t)| {
                let mut shape = vec![1];
                shape.extend_from_slice(t.shape());
                (k, Tensor::new(shape, t.into_data()))
            })
            .collect();

        let output = self.network.forward(&batched, false)?;

        let mut actions = BTreeMap::new();
        for name in self.action_spec.keys() {
            let row = output.policy.get(name).ok_or_else(|| CoreError::ConfigError {
                reason: format!("network forward did not produce head '{name}'"),
            })?;
            let draw: f32 = self.rng.gen_range(0.0..1.0);
            let idx = sample_index(row.data(), draw);
            actions.insert(name.clone(), idx as i32);
        }
        Ok(actions)
    }

    /// Append `result` to the trajectory and publish a minimal KPI batch.
    /// When `train_online` is set, triggers `train_by_trajectory`
    /// automatically once the buffer reaches `num_steps`.
    pub fn observe(&mut self, result: crate::spec::ExecutionResult) -> Result<()> {
        let mut event = KpiEvent::new();
        event.insert("reward".to_string(), Tensor::new(vec![1], vec![result.reward]));
        for (name, value) in &result.actions {
            event.insert(format!("actions.{name}"), Tensor::new(vec![1], vec![*value as f32]));
        }
        for (name, tensor) in &result.state0 {
            event.insert(format!("s0.{name}"), tensor.clone());
        }
        self.trajectory.push(result);
        self.kpi.publish(event);

        if self.train_online && self.is_ready_for_train() {
            log::debug!(
                "trajectory reached {} steps, training online",
                self.trajectory.len()
            );
            self.train_by_trajectory()?;
        }
        Ok(())
    }

    /// Train on the live trajectory buffer and clear it. A no-op if the
    /// buffer is empty.
    pub fn train_by_trajectory(&mut self) -> Result<()> {
        if self.trajectory.is_empty() {
            return Ok(());
        }
        let trajectory = std::mem::take(&mut self.trajectory);
        self.train_by_trajectory_inner(&trajectory)?;
        self.train_generation += 1;
        log::info!(
            "trained on trajectory of {} steps (generation {})",
            trajectory.len(),
            self.train_generation
        );
        Ok(())
    }

    /// Column-ify `trajectory` and dispatch to `train_batch`.
    fn train_by_trajectory_inner(&mut self, trajectory: &Trajectory) -> Result<()> {
        let columnized = trajectory.columnize();
        let mut masks = BTreeMap::new();
        for (name, actions) in &columnized.actions {
            let k = self
                .network
                .head_cardinality(name)
                .ok_or_else(|| CoreError::ConfigError {
                    reason: format!("network exposes no output head named '{name}'"),
                })?;
            masks.insert(name.clone(), one_hot(actions, k)?);
        }
        self.train_batch(
            &columnized.states,
            &masks,
            &columnized.rewards,
            Some(&columnized.terminal),
        )
    }

    /// Run one epoch (TD) or the full `num_epochs` x mini-batch schedule
    /// (PPO) over `(states, masks, rewards)`.
    pub fn train_batch(
        &mut self,
        states: &BTreeMap<String, Tensor>,
        masks: &BTreeMap<String, Tensor>,
        rewards: &Tensor,
        terminal: Option<&[bool]>,
    ) -> Result<()> {
        match self.variant {
            AgentVariant::TdSingleNn => self.train_batch_td(states, masks, rewards, terminal),
            AgentVariant::Ppo => self.train_batch_ppo(states, masks, rewards, terminal),
        }
    }

    fn train_batch_td(
        &mut self,
        states: &BTreeMap<String, Tensor>,
        masks: &BTreeMap<String, Tensor>,
        rewards: &Tensor,
        terminal: Option<&[bool]>,
    ) -> Result<()> {
        let n = rewards.rows();
        let output = match self.network.forward(states, false) {
            Ok(o) => o,
            Err(e) => return self.skip_training_step("td forward (critic)", e),
        };
        let v = output.critic.data();
        if v.len() != n + 1 {
            return Err(CoreError::ConfigError {
                reason: format!("critic output has {} rows, expected {}", v.len(), n + 1),
            });
        }

        let td = td_errors(rewards.data(), v, self.avg_reward, self.reward_alpha, terminal)?;
        self.avg_reward = td.final_avg_reward;

        let s0 = slice_state_rows(states, 0, n);
        let train_output = match self.network.forward(&s0, true) {
            Ok(o) => o,
            Err(e) => return self.skip_training_step("td forward (train)", e),
        };

        let mut grads = BTreeMap::new();
        for (name, mask) in masks {
            let pi = train_output
                .policy
                .get(name)
                .ok_or_else(|| CoreError::ConfigError {
                    reason: format!("network forward did not produce head '{name}'"),
                })?;
            let alpha = self.alphas[name];
            let grad_data: Vec<f32> = mask
                .data()
                .iter()
                .zip(pi.data().iter())
                .map(|(m, p)| alpha * m / p.max(1e-8))
                .collect();
            grads.insert(name.clone(), Tensor::new(mask.shape().to_vec(), grad_data));
        }
        let critic_alpha = self.alphas["critic"];
        grads.insert(
            "critic".to_string(),
            Tensor::new(vec![n, 1], vec![critic_alpha; n]),
        );

        let delta_signal = Tensor::scalar_column(&td.deltas);
        if let Err(e) = self.network.train(grads, &delta_signal, self.lambda) {
            return self.skip_training_step("td backward", e);
        }

        self.publish_training_kpi(rewards, &td.deltas, &td.avg_rewards, None);
        Ok(())
    }

    /// Log and publish an error-record KPI event in place of a completion
    /// event, then swallow the error so the caller moves on to the next
    /// step rather than aborting the whole trajectory/epoch.
    fn skip_training_step(&self, stage: &str, err: CoreError) -> Result<()> {
        log::error!("{stage} failed, skipping step: {err}");
        let mut event = KpiEvent::new();
        event.insert("error".to_string(), Tensor::new(vec![1], vec![1.0]));
        self.kpi.publish(event);
        Ok(())
    }

    /// Forward `states[0..n]` once under the current (pre-update) policy
    /// and return, per action head, the probability the baseline policy
    /// assigned to the action actually taken at each step (`p0` in the PPO
    /// ratio). Exposed so `BatchTrainer` can compute the same baseline
    /// once per epoch ahead of streaming mini-batches off disk.
    pub fn baseline_action_probabilities(
        &self,
        states: &BTreeMap<String, Tensor>,
        masks: &BTreeMap<String, Tensor>,
        n: usize,
    ) -> Result<BTreeMap<String, Vec<f32>>> {
        let s0 = slice_state_rows(states, 0, n);
        let baseline = self.network.forward(&s0, false)?;

        let mut p0 = BTreeMap::new();
        for (name, mask) in masks {
            let pi0 = baseline
                .policy
                .get(name)
                .ok_or_else(|| CoreError::ConfigError {
                    reason: format!("network forward did not produce head '{name}'"),
                })?;
            p0.insert(name.clone(), row_dot(mask, pi0));
        }
        Ok(p0)
    }

    fn train_batch_ppo(
        &mut self,
        states: &BTreeMap<String, Tensor>,
        masks: &BTreeMap<String, Tensor>,
        rewards: &Tensor,
        terminal: Option<&[bool]>,
    ) -> Result<()> {
        let n = rewards.rows();
        let p0 = self.baseline_action_probabilities(states, masks, n)?;

        let total = n;
        for epoch in 0..self.num_epochs {
            let mut start = 0usize;
            while start < total {
                let end = (start + self.batch_size).min(total);
                let window_states = slice_state_rows(states, start, end + 1);
                let window_masks: BTreeMap<String, Tensor> = masks
                    .iter()
                    .map(|(k, v)| (k.clone(), v.slice_rows(start, end)))
                    .collect();
                let window_rewards = rewards.slice_rows(start, end);
                let window_p0: BTreeMap<String, Vec<f32>> = p0
                    .iter()
                    .map(|(k, v)| (k.clone(), v[start..end].to_vec()))
                    .collect();
                let window_terminal = terminal.map(|t| t[start..end].to_vec());

                self.train_mini_batch(
                    epoch,
                    start,
                    total,
                    &window_states,
                    &window_masks,
                    &window_rewards,
                    &window_p0,
                    window_terminal.as_deref(),
                )?;

                start = end;
            }
        }
        Ok(())
    }

    /// PPO-only mini-batch kernel.
    #[allow(clippy::too_many_arguments)]
    pub fn train_mini_batch(
        &mut self,
        epoch: usize,
        start: usize,
        total: usize,
        states: &BTreeMap<String, Tensor>,
        masks: &BTreeMap<String, Tensor>,
        rewards: &Tensor,
        p0: &BTreeMap<String, Vec<f32>>,
        terminal: Option<&[bool]>,
    ) -> Result<()> {
        let m = rewards.rows();
        let output = match self.network.forward(states, false) {
            Ok(o) => o,
            Err(e) => return self.skip_training_step("ppo forward (critic)", e),
        };
        let v = output.critic.data();
        if v.len() != m + 1 {
            return Err(CoreError::ConfigError {
                reason: format!("critic output has {} rows, expected {}", v.len(), m + 1),
            });
        }

        let adv = n_step_advantage(rewards.data(), v, self.avg_reward, self.reward_alpha, terminal)?;
        self.avg_reward = adv.final_avg_reward;

        let s0 = slice_state_rows(states, 0, m);
        let train_output = match self.network.forward(&s0, true) {
            Ok(o) => o,
            Err(e) => return self.skip_training_step("ppo forward (train)", e),
        };

        let mut grads = BTreeMap::new();
        for (name, mask) in masks {
            let pi = train_output
                .policy
                .get(name)
                .ok_or_else(|| CoreError::ConfigError {
                    reason: format!("network forward did not produce head '{name}'"),
                })?;
            let p = row_dot(mask, pi);
            let p0_head = &p0[name];
            let alpha = self.alphas[name];
            let k = mask.shape()[1];

            let mut grad_data = vec![0.0f32; mask.len()];
            for t in 0..m {
                let ratio = p[t] / p0_head[t].max(1e-8);
                let advantage = adv.advantages[t];
                let keep_pos = ratio < 1.0 + self.ppo_epsilon;
                let keep_neg = ratio > 1.0 - self.ppo_epsilon;
                let active = (advantage >= 0.0 && keep_pos) || (advantage < 0.0 && keep_neg);
                if active {
                    let scale = alpha / p0_head[t].max(1e-8);
                    for j in 0..k {
                        grad_data[t * k + j] = mask.data()[t * k + j] * scale;
                    }
                }
            }
            grads.insert(name.clone(), Tensor::new(mask.shape().to_vec(), grad_data));
        }
        let critic_alpha = self.alphas["critic"];
        grads.insert(
            "critic".to_string(),
            Tensor::new(vec![m, 1], vec![critic_alpha; m]),
        );

        let delta_scaled: Vec<f32> = adv.deltas.iter().map(|d| d * self.eta).collect();
        let delta_signal = Tensor::scalar_column(&delta_scaled);
        if let Err(e) = self.network.train(grads, &delta_signal, self.lambda) {
            return self.skip_training_step("ppo backward", e);
        }

        self.publish_training_kpi(rewards, &adv.deltas, &adv.avg_rewards, Some((&adv.dr, &adv.dv)));
        let _ = (epoch, start, total);
        Ok(())
    }

    fn publish_training_kpi(
        &self,
        rewards: &Tensor,
        deltas: &[f32],
        avg_rewards: &[f32],
        dr_dv: Option<(&[f32], &[f32])>,
    ) {
        let mut event = KpiEvent::new();
        event.insert("reward".to_string(), rewards.clone());
        event.insert("delta".to_string(), Tensor::scalar_column(deltas));
        event.insert("avgReward".to_string(), Tensor::scalar_column(avg_rewards));
        if let Some((dr, dv)) = dr_dv {
            event.insert("dr".to_string(), Tensor::scalar_column(dr));
            event.insert("dv".to_string(), Tensor::scalar_column(dv));
        }
        self.kpi.publish(event);
    }

    /// Reinitialize network parameters deterministically given the agent's
    /// seed.
    pub fn init(&mut self, seed: u64) {
        log::info!("reinitializing agent network with seed {seed}");
        self.network.init(seed);
        self.rng = SmallRng::seed_from_u64(seed);
        self.avg_reward = 0.0;
    }

    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            reward_alpha: self.reward_alpha,
            eta: self.eta,
            lambda: self.lambda,
            num_steps: self.num_steps,
            num_epochs: self.num_epochs,
            batch_size: self.batch_size,
            ppo_epsilon: matches!(self.variant, AgentVariant::Ppo).then_some(self.ppo_epsilon),
            alphas: self.alphas.clone(),
            state: self.state_spec.clone(),
            actions: self.action_spec.clone(),
            network: self.network.topology_json(),
            input_process: Some(self.processor.json()),
        }
    }

    fn yml_path(&self) -> PathBuf {
        self.model_path.join("agent.yml")
    }

    fn bin_path(&self) -> PathBuf {
        self.model_path.join("agent.bin")
    }

    /// Serialize the JSON descriptor and the raw parameter block. Before
    /// the first overwrite of the lifetime, existing files are renamed to
    /// a timestamped backup.
    pub fn save(&mut self) -> Result<()> {
        log::info!("saving agent model to {:?}", self.model_path);
        if !self.has_backed_up && self.rename_existing_to_backup()? {
            self.has_backed_up = true;
        }
        self.write_files()
    }

    /// Unconditional backup + save: always snapshot whatever is currently
    /// on disk before writing, regardless of whether `save()` has already
    /// consumed its one-time automatic backup.
    pub fn backup(&mut self) -> Result<()> {
        log::info!("forcing agent backup at {:?}", self.model_path);
        self.rename_existing_to_backup()?;
        self.has_backed_up = true;
        self.write_files()
    }

    /// Rename any existing `agent.yml`/`agent.bin` to a timestamped
    /// backup. Returns whether a backup was actually made (nothing to do
    /// on a fresh model directory).
    fn rename_existing_to_backup(&self) -> Result<bool> {
        let yml = self.yml_path();
        let bin = self.bin_path();
        if !yml.exists() && !bin.exists() {
            return Ok(false);
        }
        let suffix = Local::now().format("%Y%m%d-%H%M%S%.f").to_string();
        if yml.exists() {
            let backup = self.model_path.join(format!("agent-{suffix}.yml"));
            std::fs::rename(&yml, &backup).map_err(|e| CoreError::io(&yml, e))?;
        }
        if bin.exists() {
            let backup = self.model_path.join(format!("agent-{suffix}.bin"));
            std::fs::rename(&bin, &backup).map_err(|e| CoreError::io(&bin, e))?;
        }
        Ok(true)
    }

    fn write_files(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.model_path)
            .map_err(|e| CoreError::io(&self.model_path, e))?;

        let descriptor = self.descriptor();
        let yml_path = self.yml_path();
        let json = serde_json::to_vec_pretty(&descriptor).map_err(|e| CoreError::ConfigError {
            reason: format!("agent descriptor should serialize: {e}"),
        })?;
        std::fs::write(&yml_path, json).map_err(|e| CoreError::io(&yml_path, e))?;

        let mut arrays = vec![("avg_reward".to_string(), Tensor::new(vec![1], vec![self.avg_reward]))];
        arrays.extend(self.network.into_named_arrays());

        let bin_path = self.bin_path();
        let mut buf = Vec::new();
        for (name, tensor) in &arrays {
            let name_bytes = name.as_bytes();
            buf.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
            buf.extend_from_slice(name_bytes);
            buf.extend_from_slice(&(tensor.shape().len() as i32).to_be_bytes());
            for dim in tensor.shape() {
                buf.extend_from_slice(&(*dim as i64).to_be_bytes());
            }
            for value in tensor.data() {
                buf.extend_from_slice(&value.to_be_bytes());
            }
        }
        std::fs::write(&bin_path, buf).map_err(|e| CoreError::io(&bin_path, e))?;
        Ok(())
    }

    /// Load the avg_reward entry and network parameters written by `save`.
    pub fn load_bin(&mut self) -> Result<()> {
        let bin_path = self.bin_path();
        let bytes = std::fs::read(&bin_path).map_err(|e| CoreError::io(&bin_path, e))?;
        let mut cursor = 0usize;
        let mut arrays = Vec::new();
        while cursor < bytes.len() {
            let name_len = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]) as usize;
            cursor += 2;
            let name = String::from_utf8_lossy(&bytes[cursor..cursor + name_len]).to_string();
            cursor += name_len;
            let rank = i32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
            cursor += 4;
            let mut shape = Vec::with_capacity(rank);
            for _ in 0..rank {
                let dim = i64::from_be_bytes(bytes[cursor..cursor + 8].try_into().unwrap()) as usize;
                shape.push(dim);
                cursor += 8;
            }
            let count: usize = shape.iter().product();
            let mut data = Vec::with_capacity(count);
            for _ in 0..count {
                let value = f32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
                data.push(value);
                cursor += 4;
            }
            cursor += 0;
            arrays.push((name, Tensor::new(shape, data)));
        }

        if let Some(pos) = arrays.iter().position(|(n, _)| n == "avg_reward") {
            let (_, t) = arrays.remove(pos);
            self.avg_reward = t.data()[0];
        }
        self.network.load_named_arrays(arrays)
    }
}

/// Inverse-CDF sampling of a probability row against uniform draw `u`,
/// tie-break: last index (a draw at or beyond the final cumulative sum
/// falls through to the last index).
fn sample_index(probs: &[f32], u: f32) -> usize {
    let mut acc = 0.0f32;
    let mut selected = probs.len().saturating_sub(1);
    for (i, p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            selected = i;
            break;
        }
    }
    selected
}

fn one_hot(actions: &Tensor, k: usize) -> Result<Tensor> {
    let n = actions.rows();
    let mut data = vec![0.0f32; n * k];
    for (i, value) in actions.data().iter().enumerate() {
        let v = *value as i32;
        if v < 0 || v as usize >= k {
            return Err(CoreError::InvalidAction {
                value: v,
                cardinality: k,
            });
        }
        data[i * k + v as usize] = 1.0;
    }
    Ok(Tensor::new(vec![n, k], data))
}

fn row_dot(mask: &Tensor, pi: &Tensor) -> Vec<f32> {
    let n = mask.rows();
    let k = mask.shape()[1];
    (0..n)
        .map(|t| {
            (0..k)
                .map(|j| mask.data()[t * k + j] * pi.data()[t * k + j])
                .sum()
        })
        .collect()
}

fn slice_state_rows(states: &BTreeMap<String, Tensor>, start: usize, end: usize) -> BTreeMap<String, Tensor> {
    states
        .iter()
        .map(|(k, v)| (k.clone(), v.slice_rows(start, end)))
        .collect()
}

#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;
    use std::collections::BTreeMap;

    /// A minimal `Network` test double: linear heads over plain `Vec<f32>`
    /// math, with no autodiff graph. Exercises `Agent` without pulling in a
    /// real tensor-backend implementation.
    #[derive(Clone)]
    pub struct MockNetwork {
        pub input_size: usize,
        pub heads: BTreeMap<String, usize>,
        pub last_grads: Option<BTreeMap<String, Tensor>>,
    }

    impl MockNetwork {
        pub fn new(input_size: usize, heads: BTreeMap<String, usize>) -> Self {
            Self {
                input_size,
                heads,
                last_grads: None,
            }
        }
    }

    impl Network for MockNetwork {
        fn forward(&self, states: &BTreeMap<String, Tensor>, _training: bool) -> Result<NetworkOutput> {
            let rows = states.values().next().map(|t| t.rows()).unwrap_or(0);
            let mut policy = BTreeMap::new();
            for (name, k) in &self.heads {
                let uniform = 1.0 / *k as f32;
                policy.insert(name.clone(), Tensor::new(vec![rows, *k], vec![uniform; rows * k]));
            }
            let critic = Tensor::new(vec![rows, 1], vec![0.5; rows]);
            let _ = self.input_size;
            Ok(NetworkOutput { policy, critic })
        }

        fn train(
            &mut self,
            grads: BTreeMap<String, Tensor>,
            _delta_signal: &Tensor,
            _lambda: f32,
        ) -> Result<()> {
            self.last_grads = Some(grads);
            Ok(())
        }

        fn head_cardinality(&self, head: &str) -> Option<usize> {
            self.heads.get(head).copied()
        }

        fn init(&mut self, _seed: u64) {}

        fn topology_json(&self) -> serde_json::Value {
            serde_json::json!({ "kind": "mock", "heads": self.heads })
        }

        fn into_named_arrays(&self) -> Vec<(String, Tensor)> {
            vec![("mock_param".to_string(), Tensor::new(vec![1], vec![1.0]))]
        }

        fn load_named_arrays(&mut self, _arrays: Vec<(String, Tensor)>) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockNetwork;
    use super::*;
    use crate::spec::{ExecutionResult, FloatSignalSpec, IntSignalSpec};
    use tempfile::tempdir;

    fn make_agent(dir: &Path, variant: AgentVariant) -> Agent<MockNetwork> {
        make_agent_with_options(dir, variant, false)
    }

    fn make_agent_with_options(dir: &Path, variant: AgentVariant, train_online: bool) -> Agent<MockNetwork> {
        let mut heads = BTreeMap::new();
        heads.insert("move".to_string(), 3);
        let network = MockNetwork::new(2, heads);

        let mut state_spec = SignalSpecMap::new();
        state_spec.insert(
            "sensor".to_string(),
            SignalSpec::Float(FloatSignalSpec { min: 0.0, max: 1.0 }),
        );
        let mut action_spec = SignalSpecMap::new();
        action_spec.insert("move".to_string(), SignalSpec::Int(IntSignalSpec { num_values: 3 }));

        let mut alphas = BTreeMap::new();
        alphas.insert("move".to_string(), 0.1);
        alphas.insert("critic".to_string(), 0.1);

        let config = AgentConfig {
            variant,
            state_spec,
            action_spec,
            reward_alpha: 0.1,
            eta: 1.0,
            alphas,
            lambda: 0.9,
            num_steps: 3,
            num_epochs: 2,
            batch_size: 2,
            ppo_epsilon: 0.2,
            model_path: dir.to_path_buf(),
            seed: 42,
            processor: None,
            train_online,
        };
        Agent::new(network, config).unwrap()
    }

    #[test]
    fn rejects_missing_alpha() {
        let dir = tempdir().unwrap();
        let mut heads = BTreeMap::new();
        heads.insert("move".to_string(), 3);
        let network = MockNetwork::new(2, heads);
        let mut action_spec = SignalSpecMap::new();
        action_spec.insert("move".to_string(), SignalSpec::Int(IntSignalSpec { num_values: 3 }));
        let mut alphas = BTreeMap::new();
        alphas.insert("critic".to_string(), 0.1);
        let config = AgentConfig {
            variant: AgentVariant::TdSingleNn,
            state_spec: SignalSpecMap::new(),
            action_spec,
            reward_alpha: 0.1,
            eta: 1.0,
            alphas,
            lambda: 0.9,
            num_steps: 3,
            num_epochs: 1,
            batch_size: 2,
            ppo_epsilon: 0.2,
            model_path: dir.path().to_path_buf(),
            seed: 1,
            processor: None,
            train_online: false,
        };
        let err = Agent::new(network, config).unwrap_err();
        assert!(matches!(err, CoreError::ConfigError { .. }));
    }

    #[test]
    fn rejects_reserved_critic_action() {
        let dir = tempdir().unwrap();
        let network = MockNetwork::new(2, BTreeMap::new());
        let mut action_spec = SignalSpecMap::new();
        action_spec.insert("critic".to_string(), SignalSpec::Int(IntSignalSpec { num_values: 2 }));
        let mut alphas = BTreeMap::new();
        alphas.insert("critic".to_string(), 0.1);
        let config = AgentConfig {
            variant: AgentVariant::TdSingleNn,
            state_spec: SignalSpecMap::new(),
            action_spec,
            reward_alpha: 0.1,
            eta: 1.0,
            alphas,
            lambda: 0.9,
            num_steps: 3,
            num_epochs: 1,
            batch_size: 2,
            ppo_epsilon: 0.2,
            model_path: dir.path().to_path_buf(),
            seed: 1,
            processor: None,
            train_online: false,
        };
        let err = Agent::new(network, config).unwrap_err();
        assert!(matches!(err, CoreError::ConfigError { .. }));
    }

    fn step(i: usize, terminal: bool) -> ExecutionResult {
        let mut state0 = BTreeMap::new();
        state0.insert("sensor".to_string(), Tensor::new(vec![1], vec![i as f32]));
        let mut state1 = BTreeMap::new();
        state1.insert("sensor".to_string(), Tensor::new(vec![1], vec![(i + 1) as f32]));
        let mut actions = BTreeMap::new();
        actions.insert("move".to_string(), (i % 3) as i32);
        ExecutionResult {
            state0,
            actions,
            reward: 1.0,
            state1,
            terminal,
        }
    }

    #[test]
    fn act_and_observe_then_train_by_trajectory() {
        let dir = tempdir().unwrap();
        let mut agent = make_agent(dir.path(), AgentVariant::TdSingleNn);

        for i in 0..3 {
            agent.observe(step(i, i == 2)).unwrap();
        }
        assert!(agent.is_ready_for_train());
        agent.train_by_trajectory().unwrap();
        assert!(agent.network.last_grads.is_some());
        assert_eq!(agent.trajectory_len(), 0);
        assert_eq!(agent.train_generation(), 1);
    }

    #[test]
    fn ppo_train_batch_runs_mini_batches() {
        let dir = tempdir().unwrap();
        let mut agent = make_agent(dir.path(), AgentVariant::Ppo);

        for i in 0..4 {
            agent.observe(step(i, false)).unwrap();
        }
        agent.train_by_trajectory().unwrap();
        assert!(agent.network.last_grads.is_some());
    }

    #[test]
    fn observe_with_train_online_auto_trains_and_clears_trajectory() {
        let dir = tempdir().unwrap();
        let mut agent = make_agent_with_options(dir.path(), AgentVariant::TdSingleNn, true);

        for i in 0..2 {
            agent.observe(step(i, false)).unwrap();
        }
        assert_eq!(agent.trajectory_len(), 2);
        assert_eq!(agent.train_generation(), 0);

        agent.observe(step(2, true)).unwrap();
        assert_eq!(agent.trajectory_len(), 0, "trajectory should be cleared by the automatic train");
        assert_eq!(agent.train_generation(), 1);
        assert!(agent.network.last_grads.is_some());
    }

    #[test]
    fn save_backup_idempotent_after_repeated_saves() {
        let dir = tempdir().unwrap();
        let mut agent = make_agent(dir.path(), AgentVariant::TdSingleNn);
        agent.save().unwrap();
        assert!(dir.path().join("agent.yml").exists());
        assert!(dir.path().join("agent.bin").exists());

        agent.save().unwrap();
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("agent-"))
            .collect();
        assert_eq!(backups.len(), 2, "expected exactly one yml+bin backup pair");

        agent.save().unwrap();
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("agent-"))
            .collect();
        assert_eq!(backups.len(), 2, "second save must not create another backup");
    }
}
