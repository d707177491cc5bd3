/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use lqnn::{DataType, LqError, LqResult, Shape};
use serde::{Deserialize, Serialize};

/// Typed element storage for a [`Tensor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    S32(Vec<i32>),
}

impl TensorData {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::F32,
            TensorData::S32(_) => DataType::S32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(data) => data.len(),
            TensorData::S32(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A shaped, typed value: constants inside a graph and the runtime buffers
/// the interpreter writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Shape,
    data: TensorData,
}

impl Tensor {
    /// Construct an F32 tensor; the data length must match the shape.
    pub fn f32(shape: impl Into<Shape>, data: Vec<f32>) -> LqResult<Self> {
        Self::new(shape.into(), TensorData::F32(data))
    }

    /// Construct an S32 tensor; the data length must match the shape.
    pub fn s32(shape: impl Into<Shape>, data: Vec<i32>) -> LqResult<Self> {
        Self::new(shape.into(), TensorData::S32(data))
    }

    fn new(shape: Shape, data: TensorData) -> LqResult<Self> {
        if data.len() != shape.num_elements() {
            return Err(LqError::InvariantViolation(format!(
                "tensor data has {} elements but shape {:?} describes {}",
                data.len(),
                shape.dims(),
                shape.num_elements()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A zero-filled tensor of the given type and shape.
    pub fn zeros(dtype: DataType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let len = shape.num_elements();
        let data = match dtype {
            DataType::F32 => TensorData::F32(vec![0.0; len]),
            DataType::S32 => TensorData::S32(vec![0; len]),
        };
        Self { shape, data }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    /// Size of the payload in bytes.
    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.dtype().size()
    }

    /// The elements as `&[f32]`, or `None` for non-F32 tensors.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(data) => Some(data),
            TensorData::S32(_) => None,
        }
    }

    /// The elements as `&mut [f32]`, or `None` for non-F32 tensors.
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(data) => Some(data),
            TensorData::S32(_) => None,
        }
    }

    /// The elements as `&[i32]`, or `None` for non-S32 tensors.
    pub fn as_s32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::S32(data) => Some(data),
            TensorData::F32(_) => None,
        }
    }

    /// The elements as `&mut [i32]`, or `None` for non-S32 tensors.
    pub fn as_s32_mut(&mut self) -> Option<&mut [i32]> {
        match &mut self.data {
            TensorData::S32(data) => Some(data),
            TensorData::F32(_) => None,
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_checks_length() {
        assert!(Tensor::f32([2, 2], vec![1.0; 4]).is_ok());
        assert!(Tensor::f32([2, 2], vec![1.0; 3]).is_err());
        assert!(Tensor::s32([3], vec![1, 2, 3]).is_ok());
    }

    #[test]
    fn typed_accessors() {
        let mut tensor = Tensor::zeros(DataType::F32, [4]);
        assert_eq!(tensor.dtype(), DataType::F32);
        assert_eq!(tensor.byte_size(), 16);
        assert!(tensor.as_s32().is_none());
        tensor.as_f32_mut().unwrap()[2] = 5.0;
        assert_eq!(tensor.as_f32().unwrap(), &[0.0, 0.0, 5.0, 0.0]);
    }
}
