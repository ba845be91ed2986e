//! Append-only columnar binary file holding a rank-`r` float32 tensor whose
//! first dimension is the record count.
//!
//! ```text
//! offset  size   meaning
//! 0       4      int32 big-endian: rank r
//! 4       8·r    r × int64 big-endian: shape[0..r)  (shape[0] unused)
//! 4+8r    4·N·s  N records × s float32 big-endian   where s = Π shape[1..r)
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use num_traits::cast::{FromPrimitive, ToPrimitive};

use crate::error::{CoreError, Result};
use crate::tensor::Tensor;

pub struct BinArrayStore {
    path: PathBuf,
    file: File,
    shape: Option<Vec<usize>>,
    position: usize,
}

impl BinArrayStore {
    /// Open (creating parent directories and the file if absent) a store at
    /// `path`, reading its header if one is already present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(&path, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| CoreError::io(&path, e))?;

        let shape = read_header(&mut file, &path)?;

        Ok(Self {
            path,
            file,
            shape,
            position: 0,
        })
    }

    /// Translate a dotted key `a.b.c` to the file `root/a/b/c/data.bin`.
    pub fn create_by_key(root: impl AsRef<Path>, key: &str) -> Result<Self> {
        let mut path = root.as_ref().to_path_buf();
        for part in key.split('.') {
            path.push(part);
        }
        path.push("data.bin");
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    fn row_size(&self) -> usize {
        self.shape
            .as_ref()
            .map(|s| s.iter().skip(1).product())
            .unwrap_or(0)
    }

    fn header_bytes(&self) -> usize {
        match &self.shape {
            Some(s) => 4 + 8 * s.len(),
            None => 0,
        }
    }

    /// Number of records currently stored, derived from file length.
    pub fn size(&self) -> Result<usize> {
        let Some(_) = &self.shape else {
            return Ok(0);
        };
        let len = self
            .file
            .metadata()
            .map_err(|e| CoreError::io(&self.path, e))?
            .len() as usize;
        let payload = len.saturating_sub(self.header_bytes());
        let row_bytes = self.row_size() * 4;
        if row_bytes == 0 {
            return Ok(0);
        }
        Ok(payload / row_bytes)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn available(&self) -> Result<usize> {
        Ok(self.size()?.saturating_sub(self.position))
    }

    pub fn seek(&mut self, i: usize) -> Result<()> {
        self.position = i;
        Ok(())
    }

    /// Write `array`; on first write the header is derived from its shape.
    /// Subsequent writes must agree on every dimension but the first.
    pub fn write(&mut self, array: &Tensor) -> Result<()> {
        match &self.shape {
            None => {
                let shape = array.shape().to_vec();
                write_header(&mut self.file, &self.path, &shape)?;
                self.shape = Some(shape);
            }
            Some(shape) => {
                array.validate_shape_matches(&self.path, shape)?;
            }
        }
        self.file
            .seek(SeekFrom::End(0))
            .map_err(|e| CoreError::io(&self.path, e))?;
        for value in array.data() {
            self.file
                .write_all(&value.to_be_bytes())
                .map_err(|e| CoreError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Read up to `n` records from the current position, returning `None`
    /// when no records remain.
    pub fn read(&mut self, n: usize) -> Result<Option<Tensor>> {
        let Some(shape) = self.shape.clone() else {
            return Err(CoreError::MissingShape {
                path: self.path.clone(),
            });
        };
        let available = self.available()?;
        if available == 0 {
            return Ok(None);
        }
        let to_read = n.min(available);
        let row_size = self.row_size();
        let offset = self.header_bytes() + self.position * row_size * 4;
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|e| CoreError::io(&self.path, e))?;

        let mut buf = vec![0u8; to_read * row_size * 4];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| CoreError::io(&self.path, e))?;
        let data: Vec<f32> = buf
            .chunks_exact(4)
            .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        self.position += to_read;

        let mut out_shape = shape;
        out_shape[0] = to_read;
        Ok(Some(Tensor::new(out_shape, data)))
    }

    /// Truncate the file and forget the header, resetting to an empty store.
    pub fn clear(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.shape = None;
        self.position = 0;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| CoreError::io(&self.path, e))
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

fn read_header(file: &mut File, path: &Path) -> Result<Option<Vec<usize>>> {
    let len = file.metadata().map_err(|e| CoreError::io(path, e))?.len();
    if len < 4 {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(0))
        .map_err(|e| CoreError::io(path, e))?;
    let mut rank_buf = [0u8; 4];
    file.read_exact(&mut rank_buf)
        .map_err(|e| CoreError::io(path, e))?;
    let rank = usize::from_i32(i32::from_be_bytes(rank_buf)).ok_or_else(|| CoreError::ConfigError {
        reason: format!("{}: negative rank in header", path.display()),
    })?;

    let mut shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        let mut dim_buf = [0u8; 8];
        file.read_exact(&mut dim_buf)
            .map_err(|e| CoreError::io(path, e))?;
        let dim = usize::from_i64(i64::from_be_bytes(dim_buf)).ok_or_else(|| CoreError::ConfigError {
            reason: format!("{}: negative shape dimension in header", path.display()),
        })?;
        shape.push(dim);
    }
    Ok(Some(shape))
}

fn write_header(file: &mut File, path: &Path, shape: &[usize]) -> Result<()> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| CoreError::io(path, e))?;
    let rank = i32::from_usize(shape.len()).ok_or_else(|| CoreError::ConfigError {
        reason: format!("{}: shape rank does not fit in i32", path.display()),
    })?;
    file.write_all(&rank.to_be_bytes())
        .map_err(|e| CoreError::io(path, e))?;
    for dim in shape {
        let dim64 = dim.to_i64().ok_or_else(|| CoreError::ConfigError {
            reason: format!("{}: shape dimension does not fit in i64", path.display()),
        })?;
        file.write_all(&dim64.to_be_bytes())
            .map_err(|e| CoreError::io(path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_write_seek_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut store = BinArrayStore::open(&path).unwrap();

        store
            .write(&Tensor::new(vec![1, 3], vec![1.0, 2.0, 3.0]))
            .unwrap();
        store
            .write(&Tensor::new(vec![1, 3], vec![4.0, 5.0, 6.0]))
            .unwrap();
        store
            .write(&Tensor::new(vec![1, 3], vec![7.0, 8.0, 9.0]))
            .unwrap();

        assert_eq!(store.size().unwrap(), 3);

        store.seek(1).unwrap();
        let read = store.read(2).unwrap().unwrap();
        assert_eq!(read.shape(), &[2, 3]);
        assert_eq!(read.data(), &[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn shape_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut store = BinArrayStore::open(&path).unwrap();
        store
            .write(&Tensor::new(vec![1, 3], vec![1.0, 2.0, 3.0]))
            .unwrap();
        let err = store
            .write(&Tensor::new(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch { .. }));
    }

    #[test]
    fn missing_shape_on_fresh_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut store = BinArrayStore::open(&path).unwrap();
        let err = store.read(1).unwrap_err();
        assert!(matches!(err, CoreError::MissingShape { .. }));
    }

    #[test]
    fn create_by_key_nests_path() {
        let dir = tempdir().unwrap();
        let store = BinArrayStore::create_by_key(dir.path(), "s0.sensor").unwrap();
        assert_eq!(store.path(), dir.path().join("s0/sensor/data.bin"));
    }
}
