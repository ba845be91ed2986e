use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the training engine. Kinds, not exception
/// hierarchies: every fallible operation in this crate returns one of these
/// variants wrapped in a `Result`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("shape mismatch at {path}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        path: PathBuf,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("no header written yet for {path}")]
    MissingShape { path: PathBuf },

    #[error("missing dataset column at {path}")]
    MissingDataset { path: PathBuf },

    #[error("invalid agent configuration: {reason}")]
    ConfigError { reason: String },

    #[error("action value {value} out of range [0, {cardinality})")]
    InvalidAction { value: i32, cardinality: usize },

    #[error("network topology graph is cyclic")]
    CycleDetected,

    #[error("empty batch passed to advantage engine")]
    BatchEmpty,
}

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
