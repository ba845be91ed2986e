//! The concrete ND-array currency used in place of a dynamically managed
//! map-of-array runtime.
//!
//! `Tensor` owns a flat, row-major `Vec<f32>` plus its shape. Integer
//! signals (actions) are represented as `Tensor` too, with values stored as
//! whole-numbered `f32`s and read back with `as_i32_rows` — this keeps a
//! single concrete type at every seam (disk format, network I/O, KPI maps)
//! instead of a parallel integer tensor type.

use crate::error::{CoreError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        let expected: usize = shape.iter().product();
        assert_eq!(
            expected,
            data.len(),
            "tensor shape {:?} does not match data length {}",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of records along the leading dimension.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Product of all dimensions after the first.
    pub fn row_size(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        let s = self.row_size();
        &self.data[i * s..(i + 1) * s]
    }

    /// Slice rows `[start, end)` into a new owned tensor with the same
    /// trailing shape.
    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        let s = self.row_size();
        let mut shape = self.shape.clone();
        if let Some(first) = shape.first_mut() {
            *first = end - start;
        }
        Tensor::new(shape, self.data[start * s..end * s].to_vec())
    }

    pub fn validate_shape_matches(&self, path: &std::path::Path, expected: &[usize]) -> Result<()> {
        if self.shape[1..] != expected[1..] {
            return Err(CoreError::ShapeMismatch {
                path: path.to_path_buf(),
                expected: expected.to_vec(),
                actual: self.shape.clone(),
            });
        }
        Ok(())
    }

    pub fn scalar_column(values: &[f32]) -> Tensor {
        Tensor::new(vec![values.len(), 1], values.to_vec())
    }

    pub fn as_i32_rows(&self) -> Vec<i32> {
        self.data.iter().map(|v| *v as i32).collect()
    }
}

/// Concatenate tensors along the leading dimension. All tensors must share
/// their trailing shape.
pub fn cat_rows(tensors: &[Tensor]) -> Tensor {
    assert!(!tensors.is_empty());
    let trailing = tensors[0].shape[1..].to_vec();
    let mut rows = 0usize;
    let mut data = Vec::new();
    for t in tensors {
        assert_eq!(&t.shape[1..], trailing.as_slice());
        rows += t.rows();
        data.extend_from_slice(&t.data);
    }
    let mut shape = vec![rows];
    shape.extend(trailing);
    Tensor::new(shape, data)
}
