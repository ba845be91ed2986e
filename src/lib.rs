//! Temporal-Difference Actor-Critic (TD/A2C) and PPO training engine.
//!
//! A single shared [`Network`](spec::Network) produces, for a given state,
//! both a set of named discrete action policies and a scalar critic
//! estimate. [`Agent`](agent::Agent) is the stateful learner (on-line,
//! per-step); [`BatchTrainer`](trainer::BatchTrainer) drives off-line
//! training over trajectories recorded to disk via
//! [`BinArrayStore`](binfile::BinArrayStore)/[`KeyedFileMap`](keyed::KeyedFileMap).

pub mod advantage;
pub mod agent;
pub mod binfile;
pub mod config;
pub mod error;
pub mod keyed;
pub mod kpi;
pub mod logging;
pub mod mask;
pub mod pool;
pub mod processor;
pub mod spec;
pub mod tensor;
pub mod trainer;

pub use agent::{Agent, AgentConfig, AgentDescriptor, AgentVariant};
pub use config::EngineConfig;
pub use error::{CoreError, Result};
pub use spec::{
    ExecutionResult, FloatSignalSpec, IntSignalSpec, Network, NetworkOutput, SignalSpec,
    SignalSpecMap, Trajectory,
};
pub use tensor::Tensor;
pub use trainer::{BatchTrainer, BatchTrainerConfig};
