//! `KeyedFileMap`: a mapping from dotted key paths to
//! `BinArrayStore` instances, built by walking a filesystem tree rooted at
//! a directory. A directory containing `data.bin` contributes its dotted
//! path (relative to the root) as the key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::binfile::BinArrayStore;
use crate::error::{CoreError, Result};
use crate::pool::join_all;
use crate::tensor::Tensor;

pub struct KeyedFileMap {
    stores: BTreeMap<String, BinArrayStore>,
}

impl KeyedFileMap {
    /// Walk `path`, including every descendant whose key equals one of
    /// `keys` or starts with `k + "."`. An empty `keys` list includes
    /// everything under `path`.
    pub fn create(path: impl AsRef<Path>, keys: &[&str]) -> Result<Self> {
        let root = path.as_ref();
        let mut discovered = Vec::new();
        discover(root, root, &mut discovered)?;

        let mut stores = BTreeMap::new();
        for (key, file_path) in discovered {
            if keys.is_empty() || key_matches(&key, keys) {
                stores.insert(key, BinArrayStore::open(file_path)?);
            }
        }
        Ok(Self { stores })
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.stores.keys()
    }

    pub fn get(&self, key: &str) -> Option<&BinArrayStore> {
        self.stores.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut BinArrayStore> {
        self.stores.get_mut(key)
    }

    /// Rekey by stripping `parent + "."` prefix; entries without the prefix
    /// are dropped from the returned map (the backing stores are moved, not
    /// copied).
    pub fn children(self, parent: &str) -> Self {
        let prefix = format!("{parent}.");
        let stores = self
            .stores
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v)))
            .collect();
        Self { stores }
    }

    /// Read up to `n` records from every member in parallel, over the
    /// worker pool; returns the map atomically iff every file returned a
    /// non-empty tensor.
    pub fn read(&mut self, n: usize) -> Result<Option<BTreeMap<String, Tensor>>> {
        let items: Vec<(String, &mut BinArrayStore)> =
            self.stores.iter_mut().map(|(k, v)| (k.clone(), v)).collect();
        let results = join_all(items, |_k, store| store.read(n))?;
        let mut out = BTreeMap::new();
        for (key, maybe) in results {
            match maybe {
                Some(t) if !t.is_empty() => {
                    out.insert(key, t);
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(out))
    }

    pub fn seek(&mut self, i: usize) -> Result<()> {
        for store in self.stores.values_mut() {
            store.seek(i)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.seek(0)
    }

    pub fn flush(&mut self) -> Result<()> {
        for store in self.stores.values_mut() {
            store.flush()?;
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        for (_, store) in self.stores {
            store.close()?;
        }
        Ok(())
    }

    /// Assert all members share a shape, else `SHAPE_MISMATCH` listing the
    /// offenders and the reference (the first member's shape).
    pub fn validate_shapes(&self) -> Result<()> {
        let Some((ref_key, reference)) = self
            .stores
            .iter()
            .find_map(|(k, v)| v.shape().map(|s| (k.clone(), s.to_vec())))
        else {
            return Ok(());
        };
        for (key, store) in &self.stores {
            if let Some(shape) = store.shape() {
                if shape[1..] != reference[1..] {
                    return Err(CoreError::ShapeMismatch {
                        path: store.path().to_path_buf(),
                        expected: reference,
                        actual: shape.to_vec(),
                    });
                }
            }
            let _ = (key, ref_key.as_str());
        }
        Ok(())
    }

    /// Assert all members share a record count.
    pub fn validate_sizes(&self) -> Result<()> {
        let mut reference: Option<(String, usize)> = None;
        for (key, store) in &self.stores {
            let size = store.size()?;
            match &reference {
                None => reference = Some((key.clone(), size)),
                Some((_, ref_size)) if *ref_size != size => {
                    return Err(CoreError::ShapeMismatch {
                        path: store.path().to_path_buf(),
                        expected: vec![*ref_size],
                        actual: vec![size],
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn key_matches(key: &str, keys: &[&str]) -> bool {
    keys.iter()
        .any(|k| key == *k || key.starts_with(&format!("{k}.")))
}

fn discover(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| CoreError::io(dir, e))?;
    let mut has_data_bin = false;
    let mut subdirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CoreError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.file_name().and_then(|n| n.to_str()) == Some("data.bin") {
            has_data_bin = true;
        }
    }
    if has_data_bin {
        let rel = dir.strip_prefix(root).unwrap_or(dir);
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(".");
        if !key.is_empty() {
            out.push((key, dir.join("data.bin")));
        }
    }
    for sub in subdirs {
        discover(root, &sub, out)?;
    }
    Ok(())
}

/// Parallel batched read across an arbitrary set of stores identified by
/// key, used by `ActionMaskMaterializer` and `BatchTrainer::prepare` where
/// the per-key work (not just the read) is worth scheduling on the pool.
pub fn parallel_for_each_key<T, F>(
    keys: Vec<String>,
    f: F,
) -> Result<BTreeMap<String, T>>
where
    T: Send,
    F: Fn(&str) -> Result<T> + Send + Sync,
{
    let items: Vec<(String, ())> = keys.into_iter().map(|k| (k, ())).collect();
    join_all(items, |k, _| f(k))
}
