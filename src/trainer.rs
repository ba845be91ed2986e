//! Off-line driver: validates a dataset directory, materializes action
//! masks, iterates over epochs x mini-batches streamed from disk, calls
//! `Agent.train_mini_batch`/`train_batch`, emits progress/KPI events.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::binfile::BinArrayStore;
use crate::error::{CoreError, Result};
use crate::kpi::{KpiEvent, KpiPublisher, KpiSubscriber};
use crate::mask::{materialize_masks, MaskJob};
use crate::spec::{Network, SignalSpecMap};
use crate::tensor::Tensor;

use crate::agent::Agent;

pub struct BatchTrainerConfig {
    pub dataset_root: PathBuf,
    pub scratch_root: PathBuf,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub mask_chunk_rows: usize,
    /// When set, installs the process-wide logger (idempotent across
    /// repeated `BatchTrainer::new` calls) pointed at this file.
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

pub struct BatchTrainer<N: Network> {
    config: BatchTrainerConfig,
    mask_paths: BTreeMap<String, PathBuf>,
    stopped: Arc<AtomicBool>,
    kpi: KpiPublisher,
    _marker: std::marker::PhantomData<N>,
}

impl<N: Network> BatchTrainer<N> {
    pub fn new(config: BatchTrainerConfig) -> Self {
        if let Some(log_file) = &config.log_file {
            crate::logging::init_logging(log_file, crate::logging::level_from_str(&config.log_level));
        }
        log::info!(
            "batch trainer constructed: dataset_root={:?} scratch_root={:?}",
            config.dataset_root,
            config.scratch_root
        );
        Self {
            config,
            mask_paths: BTreeMap::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            kpi: KpiPublisher::new(crate::kpi::DEFAULT_CAPACITY),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn kpi_subscriber(&self) -> KpiSubscriber {
        self.kpi.subscribe()
    }

    /// A cooperative stop signal observed at mini-batch boundaries.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn dataset_dir(&self, name: &str) -> PathBuf {
        self.config.dataset_root.join(name)
    }

    /// Open `D/s0/...`, `D/actions/...`, `D/reward`; assert shapes/sizes
    /// consistent; `s0`/`actions` non-empty; row counts equal across
    /// columns (tolerance of 1 for reward vs s0, since s0 holds n+1 rows
    /// and reward holds n).
    pub fn validate(&self) -> Result<()> {
        log::debug!("validating dataset at {:?}", self.config.dataset_root);
        let s0_dir = self.dataset_dir("s0");
        let actions_dir = self.dataset_dir("actions");
        let reward_path = self.dataset_dir("reward").join("data.bin");

        if !s0_dir.exists() {
            return Err(CoreError::MissingDataset { path: s0_dir });
        }
        if !actions_dir.exists() {
            return Err(CoreError::MissingDataset { path: actions_dir });
        }
        if !reward_path.exists() {
            return Err(CoreError::MissingDataset { path: reward_path });
        }

        let s0_map = crate::keyed::KeyedFileMap::create(&s0_dir, &[])?;
        if s0_map.is_empty() {
            return Err(CoreError::MissingDataset { path: s0_dir });
        }
        s0_map.validate_sizes()?;

        let actions_map = crate::keyed::KeyedFileMap::create(&actions_dir, &[])?;
        if actions_map.is_empty() {
            return Err(CoreError::MissingDataset { path: actions_dir });
        }
        actions_map.validate_sizes()?;

        let reward_store = BinArrayStore::open(&reward_path)?;
        let reward_n = reward_store.size()?;

        let s0_n = s0_map
            .keys()
            .next()
            .and_then(|k| s0_map.get(k))
            .map(|s| s.size())
            .transpose()?
            .unwrap_or(0);
        let actions_n = actions_map
            .keys()
            .next()
            .and_then(|k| actions_map.get(k))
            .map(|s| s.size())
            .transpose()?
            .unwrap_or(0);

        if actions_n != reward_n {
            return Err(CoreError::ShapeMismatch {
                path: actions_dir,
                expected: vec![reward_n],
                actual: vec![actions_n],
            });
        }
        // s0 carries n+1 rows; a tolerance of 1 against reward's n rows is
        // allowed.
        if s0_n != reward_n + 1 && s0_n != reward_n {
            return Err(CoreError::ShapeMismatch {
                path: s0_dir,
                expected: vec![reward_n + 1],
                actual: vec![s0_n],
            });
        }
        let _ = reward_store.close();
        Ok(())
    }

    /// For each action head, compute layer output size from the network
    /// and materialize the mask file under the scratch root, in parallel
    /// across heads.
    pub fn prepare(&mut self, agent: &Agent<N>, action_spec: &SignalSpecMap) -> Result<()> {
        let mut jobs = Vec::new();
        for name in action_spec.keys() {
            let k = agent
                .network()
                .head_cardinality(name)
                .ok_or_else(|| CoreError::ConfigError {
                    reason: format!("network exposes no output head named '{name}'"),
                })?;
            jobs.push(MaskJob {
                action_key: name.clone(),
                cardinality: k,
            });
        }
        self.mask_paths = materialize_masks(
            &self.config.dataset_root,
            &self.config.scratch_root,
            jobs,
            self.config.mask_chunk_rows,
        )?;
        log::info!("materialized {} action mask(s)", self.mask_paths.len());
        Ok(())
    }

    /// For `epoch = 0..num_epochs`, seek all streams to 0 and iterate
    /// mini-batches, calling `agent.train_mini_batch`/`train_batch`'s PPO
    /// kernel on each window; publish progress and agent-forwarded KPIs;
    /// auto-save at the end of each epoch.
    pub fn train(&mut self, agent: &mut Agent<N>, action_spec: &SignalSpecMap) -> Result<()> {
        let total = self.total_rows()?;

        let mut s0_map = crate::keyed::KeyedFileMap::create(&self.dataset_dir("s0"), &[])?;
        let mut reward_store = BinArrayStore::open(self.dataset_dir("reward").join("data.bin"))?;
        let mut mask_stores: BTreeMap<String, BinArrayStore> = action_spec
            .keys()
            .map(|name| {
                let path = self
                    .mask_paths
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CoreError::MissingDataset {
                        path: self.config.scratch_root.join(name),
                    })?;
                Ok((name.clone(), BinArrayStore::open(path)?))
            })
            .collect::<Result<_>>()?;

        // Baseline policy for the PPO ratio is forwarded once, against the
        // network as it stood before any mini-batch update, and reused
        // across every epoch and mini-batch window (`Agent::train_batch_ppo`
        // computes its own `p0` once before its epoch loop the same way).
        s0_map.reset()?;
        let full_states = s0_map
            .read(total + 1)?
            .ok_or_else(|| CoreError::MissingDataset {
                path: self.dataset_dir("s0"),
            })?;
        let full_masks: BTreeMap<String, Tensor> = mask_stores
            .iter_mut()
            .map(|(name, store)| -> Result<(String, Tensor)> {
                let mask = store.read(total)?.ok_or_else(|| CoreError::MissingDataset {
                    path: self.config.scratch_root.join(name),
                })?;
                Ok((name.clone(), mask))
            })
            .collect::<Result<_>>()?;
        let p0_full = agent.baseline_action_probabilities(&full_states, &full_masks, total)?;

        for epoch in 0..self.config.num_epochs {
            log::info!("epoch {}/{} starting", epoch + 1, self.config.num_epochs);
            s0_map.reset()?;
            reward_store.seek(0)?;
            for store in mask_stores.values_mut() {
                store.seek(0)?;
            }

            let mut processed = 0usize;
            while processed < total {
                if self.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let batch_size = self.config.batch_size.min(total - processed);

                // s0 windows overlap by one row (row `processed + batch_size`
                // is both this window's last state and the next window's
                // first), so reseek to `processed` rather than reading
                // sequentially off the cursor the masks/reward streams use.
                s0_map.seek(processed)?;
                let Some(states) = s0_map.read(batch_size + 1)? else {
                    break;
                };
                let Some(rewards) = reward_store.read(batch_size)? else {
                    break;
                };

                let mut masks = BTreeMap::new();
                let mut exhausted = false;
                for (name, store) in mask_stores.iter_mut() {
                    match store.read(batch_size)? {
                        Some(mask) => {
                            masks.insert(name.clone(), mask);
                        }
                        None => {
                            exhausted = true;
                            break;
                        }
                    }
                }
                if exhausted {
                    break;
                }

                let p0: BTreeMap<String, Vec<f32>> = p0_full
                    .iter()
                    .map(|(k, v)| (k.clone(), v[processed..processed + batch_size].to_vec()))
                    .collect();

                agent.train_mini_batch(epoch, processed, total, &states, &masks, &rewards, &p0, None)?;

                let mut event = KpiEvent::new();
                event.insert(
                    "counters".to_string(),
                    Tensor::new(
                        vec![4],
                        vec![
                            epoch as f32,
                            self.config.num_epochs as f32,
                            processed as f32,
                            total as f32,
                        ],
                    ),
                );
                self.kpi.publish(event);

                processed += batch_size;
            }

            agent.save()?;
            if self.stopped.load(Ordering::SeqCst) {
                log::warn!("training stopped cooperatively during epoch {}", epoch + 1);
                break;
            }
            log::info!("epoch {}/{} complete", epoch + 1, self.config.num_epochs);
        }
        Ok(())
    }

    fn total_rows(&self) -> Result<usize> {
        let reward_path = self.dataset_dir("reward").join("data.bin");
        let store = BinArrayStore::open(reward_path)?;
        store.size()
    }

    pub fn close(self) -> Result<()> {
        self.kpi.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::MockNetwork;
    use crate::agent::{AgentConfig, AgentVariant};
    use crate::spec::{FloatSignalSpec, IntSignalSpec, SignalSpec};
    use tempfile::tempdir;

    fn write_column(path: &Path, shape: Vec<usize>, rows: Vec<Vec<f32>>) {
        let mut store = BinArrayStore::open(path).unwrap();
        for row in rows {
            store.write(&Tensor::new(shape.clone(), row)).unwrap();
        }
        store.flush().unwrap();
    }

    #[test]
    fn validate_accepts_well_formed_dataset() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_column(
            &root.join("s0/sensor/data.bin"),
            vec![1, 1],
            vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]],
        );
        write_column(
            &root.join("actions/move/data.bin"),
            vec![1, 1],
            vec![vec![0.0], vec![1.0], vec![2.0]],
        );
        write_column(
            &root.join("reward/data.bin"),
            vec![1, 1],
            vec![vec![1.0], vec![1.0], vec![1.0]],
        );

        let trainer: BatchTrainer<MockNetwork> = BatchTrainer::new(BatchTrainerConfig {
            dataset_root: root.to_path_buf(),
            scratch_root: dir.path().join("scratch"),
            batch_size: 2,
            num_epochs: 1,
            mask_chunk_rows: 1024,
            log_file: None,
            log_level: "info".to_string(),
        });
        trainer.validate().unwrap();
    }

    #[test]
    fn validate_rejects_missing_column() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_column(
            &root.join("s0/sensor/data.bin"),
            vec![1, 1],
            vec![vec![0.0], vec![1.0]],
        );
        let trainer: BatchTrainer<MockNetwork> = BatchTrainer::new(BatchTrainerConfig {
            dataset_root: root.to_path_buf(),
            scratch_root: dir.path().join("scratch"),
            batch_size: 2,
            num_epochs: 1,
            mask_chunk_rows: 1024,
            log_file: None,
            log_level: "info".to_string(),
        });
        let err = trainer.validate().unwrap_err();
        assert!(matches!(err, CoreError::MissingDataset { .. }));
    }

    #[test]
    fn prepare_and_train_run_end_to_end() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_column(
            &root.join("s0/sensor/data.bin"),
            vec![1, 1],
            vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]],
        );
        write_column(
            &root.join("actions/move/data.bin"),
            vec![1, 1],
            vec![vec![0.0], vec![1.0], vec![2.0]],
        );
        write_column(
            &root.join("reward/data.bin"),
            vec![1, 1],
            vec![vec![1.0], vec![1.0], vec![1.0]],
        );

        let mut heads = BTreeMap::new();
        heads.insert("move".to_string(), 3);
        let network = MockNetwork::new(1, heads);

        let mut state_spec = SignalSpecMap::new();
        state_spec.insert("sensor".to_string(), SignalSpec::Float(FloatSignalSpec { min: 0.0, max: 1.0 }));
        let mut action_spec = SignalSpecMap::new();
        action_spec.insert("move".to_string(), SignalSpec::Int(IntSignalSpec { num_values: 3 }));
        let mut alphas = BTreeMap::new();
        alphas.insert("move".to_string(), 0.1);
        alphas.insert("critic".to_string(), 0.1);

        let mut agent = Agent::new(
            network,
            AgentConfig {
                variant: AgentVariant::Ppo,
                state_spec,
                action_spec: action_spec.clone(),
                reward_alpha: 0.1,
                eta: 1.0,
                alphas,
                lambda: 0.9,
                num_steps: 3,
                num_epochs: 1,
                batch_size: 2,
                ppo_epsilon: 0.2,
                model_path: root.join("model"),
                seed: 7,
                processor: None,
                train_online: false,
            },
        )
        .unwrap();

        let mut trainer: BatchTrainer<MockNetwork> = BatchTrainer::new(BatchTrainerConfig {
            dataset_root: root.to_path_buf(),
            scratch_root: root.join("scratch"),
            batch_size: 2,
            num_epochs: 1,
            mask_chunk_rows: 1024,
            log_file: None,
            log_level: "info".to_string(),
        });
        trainer.validate().unwrap();
        trainer.prepare(&agent, &action_spec).unwrap();
        trainer.train(&mut agent, &action_spec).unwrap();
        assert!(root.join("model/agent.yml").exists());
    }
}
