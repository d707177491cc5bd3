/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use serde::{Deserialize, Serialize};

/// The dimensions of a tensor, outermost dimension first.
///
/// Shapes in this toolchain are small (the supported operators have rank at
/// most 3), so a plain vector is used for storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Construct a shape from its dimensions.
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    /// The number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// The extent of dimension `d`.
    ///
    /// # Panics
    ///
    /// Panics if `d >= self.rank()`.
    pub fn dim(&self, d: usize) -> usize {
        self.dims[d]
    }

    /// All dimensions as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total number of elements described by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Linear offset of `(d0, d1)` for a rank-2 row-major layout.
    ///
    /// # Panics
    ///
    /// Panics if `self.rank() != 2`.
    pub fn offset2(&self, d0: usize, d1: usize) -> usize {
        assert_eq!(self.rank(), 2);
        d0 * self.dims[1] + d1
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

///////////
// Tests //
///////////
