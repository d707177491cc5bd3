/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Row-major matrix views over dense slices.
//!
//! These add 2-dimensional meaning to flat buffers without taking ownership;
//! the quantization and kernel code uses them to walk per-output-neuron rows.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
#[error(
    "tried to construct a matrix view with {nrows} rows and {ncols} columns over a slice \
     of length {len}"
)]
pub struct TryFromError {
    pub len: usize,
    pub nrows: usize,
    pub ncols: usize,
}

/// An immutable view interpreting a slice as an `nrows x ncols` row-major
/// matrix.
#[derive(Debug, Clone, Copy)]
pub struct MatrixView<'a, T> {
    data: &'a [T],
    nrows: usize,
    ncols: usize,
}

impl<'a, T> MatrixView<'a, T> {
    /// Construct a view over `data`. The slice length must equal
    /// `nrows * ncols`.
    pub fn try_new(data: &'a [T], nrows: usize, ncols: usize) -> Result<Self, TryFromError> {
        if data.len() != nrows * ncols {
            return Err(TryFromError {
                len: data.len(),
                nrows,
                ncols,
            });
        }
        Ok(Self { data, nrows, ncols })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }

    /// Return row `row` as a slice.
    ///
    /// # Panics
    ///
    /// Panics if `row >= self.nrows()`.
    pub fn row(&self, row: usize) -> &'a [T] {
        assert!(row < self.nrows);
        &self.data[row * self.ncols..(row + 1) * self.ncols]
    }

    /// Iterate over the rows in order.
    pub fn row_iter(&self) -> impl Iterator<Item = &'a [T]> + '_ {
        self.data.chunks_exact(self.ncols)
    }
}

/// The mutable companion of [`MatrixView`].
#[derive(Debug)]
pub struct MatrixViewMut<'a, T> {
    data: &'a mut [T],
    nrows: usize,
    ncols: usize,
}

impl<'a, T> MatrixViewMut<'a, T> {
    /// Construct a mutable view over `data`. The slice length must equal
    /// `nrows * ncols`.
    pub fn try_new(data: &'a mut [T], nrows: usize, ncols: usize) -> Result<Self, TryFromError> {
        if data.len() != nrows * ncols {
            return Err(TryFromError {
                len: data.len(),
                nrows,
                ncols,
            });
        }
        Ok(Self { data, nrows, ncols })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Return row `row` as a mutable slice.
    ///
    /// # Panics
    ///
    /// Panics if `row >= self.nrows()`.
    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        assert!(row < self.nrows);
        &mut self.data[row * self.ncols..(row + 1) * self.ncols]
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_contiguous() {
        let data = [0, 1, 2, 3, 4, 5];
        let view = MatrixView::try_new(&data, 2, 3).unwrap();
        assert_eq!(view.row(0), &[0, 1, 2]);
        assert_eq!(view.row(1), &[3, 4, 5]);
        assert_eq!(view.row_iter().count(), 2);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let data = [0, 1, 2];
        let err = MatrixView::try_new(&data, 2, 2).unwrap_err();
        assert_eq!(
            err,
            TryFromError {
                len: 3,
                nrows: 2,
                ncols: 2
            }
        );
    }

    #[test]
    fn mutable_rows() {
        let mut data = [0i32; 6];
        let mut view = MatrixViewMut::try_new(&mut data, 3, 2).unwrap();
        view.row_mut(1).copy_from_slice(&[7, 8]);
        assert_eq!(data, [0, 0, 7, 8, 0, 0]);
    }
}
