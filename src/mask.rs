//! Converts an actions column of integer indices into a one-hot mask
//! column sized by the network's action output dimension, streaming
//! through a bounded memory window and running one task per action head
//! in parallel via the worker pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::binfile::BinArrayStore;
use crate::error::{CoreError, Result};
use crate::pool::join_all;
use crate::tensor::Tensor;

/// One action head to materialize: its dotted key under `dataset/actions/`
/// and the cardinality `k` of its one-hot mask.
pub struct MaskJob {
    pub action_key: String,
    pub cardinality: usize,
}

/// Materialize masks for every job, each written to
/// `scratch_root/<action_key>/data.bin`, streaming `chunk_rows` records at
/// a time. Returns the path of each written mask file keyed by action key.
pub fn materialize_masks(
    dataset_root: &Path,
    scratch_root: &Path,
    jobs: Vec<MaskJob>,
    chunk_rows: usize,
) -> Result<BTreeMap<String, PathBuf>> {
    let items: Vec<(String, MaskJob)> = jobs
        .into_iter()
        .map(|j| (j.action_key.clone(), j))
        .collect();

    join_all(items, |_key, job| {
        materialize_one(dataset_root, scratch_root, &job, chunk_rows)
    })
}

fn materialize_one(
    dataset_root: &Path,
    scratch_root: &Path,
    job: &MaskJob,
    chunk_rows: usize,
) -> Result<PathBuf> {
    let mut input_path = dataset_root.to_path_buf();
    input_path.push("actions");
    for part in job.action_key.split('.') {
        input_path.push(part);
    }
    input_path.push("data.bin");
    if !input_path.exists() {
        return Err(CoreError::MissingDataset { path: input_path });
    }

    let mut input = BinArrayStore::open(&input_path)?;
    let out_path = {
        let mut p = scratch_root.to_path_buf();
        for part in job.action_key.split('.') {
            p.push(part);
        }
        p.push("data.bin");
        p
    };
    let mut output = BinArrayStore::open(&out_path)?;

    loop {
        let Some(chunk) = input.read(chunk_rows)? else {
            break;
        };
        let rows = chunk.rows();
        let mut mask_data = vec![0.0f32; rows * job.cardinality];
        for (row_idx, value) in chunk.data().iter().enumerate() {
            let v = *value as i32;
            if v < 0 || v as usize >= job.cardinality {
                return Err(CoreError::InvalidAction {
                    value: v,
                    cardinality: job.cardinality,
                });
            }
            mask_data[row_idx * job.cardinality + v as usize] = 1.0;
        }
        output.write(&Tensor::new(vec![rows, job.cardinality], mask_data))?;
    }
    output.flush()?;
    Ok(out_path)
}
