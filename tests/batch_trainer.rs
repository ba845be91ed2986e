//! Crate-level integration test: builds a synthetic dataset directory and
//! drives one full `BatchTrainer` pass end to end against the library's
//! public API.

use std::collections::BTreeMap;

use td_ppo_engine::agent::mock::MockNetwork;
use td_ppo_engine::binfile::BinArrayStore;
use td_ppo_engine::{
    Agent, AgentConfig, AgentVariant, BatchTrainer, BatchTrainerConfig, FloatSignalSpec,
    IntSignalSpec, SignalSpec, SignalSpecMap, Tensor,
};
use tempfile::tempdir;

fn write_column(path: &std::path::Path, shape: Vec<usize>, rows: Vec<Vec<f32>>) {
    let mut store = BinArrayStore::open(path).unwrap();
    for row in rows {
        store.write(&Tensor::new(shape.clone(), row)).unwrap();
    }
    store.flush().unwrap();
}

#[test]
fn full_offline_training_pass_over_synthetic_dataset() {
    let dir = tempdir().unwrap();
    let root = dir.path();

    let n = 6usize;
    let s0_rows: Vec<Vec<f32>> = (0..=n).map(|i| vec![i as f32 * 0.1]).collect();
    let action_rows: Vec<Vec<f32>> = (0..n).map(|i| vec![(i % 3) as f32]).collect();
    let reward_rows: Vec<Vec<f32>> = (0..n).map(|_| vec![1.0]).collect();

    write_column(&root.join("s0/sensor/data.bin"), vec![1, 1], s0_rows);
    write_column(&root.join("actions/move/data.bin"), vec![1, 1], action_rows);
    write_column(&root.join("reward/data.bin"), vec![1, 1], reward_rows);

    let mut heads = BTreeMap::new();
    heads.insert("move".to_string(), 3);
    let network = MockNetwork::new(1, heads);

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
            num_steps: n,
            num_epochs: 2,
            batch_size: 2,
            ppo_epsilon: 0.2,
            model_path: root.join("model"),
            seed: 11,
            processor: None,
            train_online: false,
        },
    )
    .unwrap();

    let mut trainer: BatchTrainer<MockNetwork> = BatchTrainer::new(BatchTrainerConfig {
        dataset_root: root.to_path_buf(),
        scratch_root: root.join("scratch"),
        batch_size: 2,
        num_epochs: 2,
        mask_chunk_rows: 1024,
        log_file: None,
        log_level: "info".to_string(),
    });

    let kpi_sub = trainer.kpi_subscriber();

    trainer.validate().unwrap();
    trainer.prepare(&agent, &action_spec).unwrap();
    trainer.train(&mut agent, &action_spec).unwrap();
    trainer.close().unwrap();

    assert!(root.join("model/agent.yml").exists());
    assert!(root.join("model/agent.bin").exists());
    assert!(!kpi_sub.drain().is_empty(), "progress KPI events should have been published");
}

#[test]
fn act_observe_round_trip_samples_from_policy() {
    let dir = tempdir().unwrap();
    let mut heads = BTreeMap::new();
    heads.insert("move".to_string(), 2);
    let network = MockNetwork::new(1, heads);

    let mut state_spec = SignalSpecMap::new();
    state_spec.insert(
        "sensor".to_string(),
        SignalSpec::Float(FloatSignalSpec { min: 0.0, max: 1.0 }),
    );
    let mut action_spec = SignalSpecMap::new();
    action_spec.insert("move".to_string(), SignalSpec::Int(IntSignalSpec { num_values: 2 }));
    let mut alphas = BTreeMap::new();
    alphas.insert("move".to_string(), 0.1);
    alphas.insert("critic".to_string(), 0.1);

    let mut agent = Agent::new(
        network,
        AgentConfig {
            variant: AgentVariant::TdSingleNn,
            state_spec,
            action_spec,
            reward_alpha: 0.1,
            eta: 1.0,
            alphas,
            lambda: 0.9,
            num_steps: 2,
            num_epochs: 1,
            batch_size: 1,
            ppo_epsilon: 0.2,
            model_path: dir.path().to_path_buf(),
            seed: 3,
            processor: None,
            train_online: true,
        },
    )
    .unwrap();

    let mut state = BTreeMap::new();
    state.insert("sensor".to_string(), Tensor::new(vec![1], vec![0.5]));

    let actions = agent.act(&state).unwrap();
    let chosen = actions["move"];
    assert!(chosen == 0 || chosen == 1);

    let mut state1 = BTreeMap::new();
    state1.insert("sensor".to_string(), Tensor::new(vec![1], vec![0.6]));
    let mut taken = BTreeMap::new();
    taken.insert("move".to_string(), chosen);

    for terminal in [false, true] {
        agent
            .observe(td_ppo_engine::ExecutionResult {
                state0: state.clone(),
                actions: taken.clone(),
                reward: 1.0,
                state1: state1.clone(),
                terminal,
            })
            .unwrap();
    }

    assert_eq!(agent.trajectory_len(), 0, "train_online should drain the trajectory once full");
    assert_eq!(agent.train_generation(), 1);
}
