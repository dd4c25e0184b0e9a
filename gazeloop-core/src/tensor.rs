//! Host-side tensor

use crate::error::{Error, Result};

/// Shaped `f32` buffer living in host memory.
///
/// A `HostTensor` is produced by taking a finished readback or by a frame
/// adapter building a model input. It is deliberately not `Clone`: whoever
/// holds it owns the only copy, and dropping it is the release.
#[derive(Debug, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    /// Build a tensor, checking that `shape` describes exactly `data.len()` elements.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| Error::MalformedOutput(format!("shape {:?} overflows", shape)))?;

        if expected != data.len() {
            return Err(Error::MalformedOutput(format!(
                "shape {:?} describes {} elements but buffer holds {}",
                shape,
                expected,
                data.len()
            )));
        }

        Ok(Self { shape, data })
    }

    /// One-dimensional tensor over `data`.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}
