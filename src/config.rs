//! Ambient engine configuration: worker-pool size, KPI buffer capacity,
//! log level/file, and mask chunk size, loaded as a serde struct with
//! `#[serde(default = ...)]` fields. Plain `serde_json`-backed rather than
//! a `burn::Config` derive, since that macro belongs to the network layer
//! owned elsewhere.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::kpi::DEFAULT_CAPACITY;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default = "default_kpi_buffer_capacity")]
    pub kpi_buffer_capacity: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_mask_chunk_rows")]
    pub mask_chunk_rows: usize,
}

fn default_kpi_buffer_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mask_chunk_rows() -> usize {
    4096
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            kpi_buffer_capacity: default_kpi_buffer_capacity(),
            log_level: default_log_level(),
            log_file: None,
            mask_chunk_rows: default_mask_chunk_rows(),
        }
    }
}
