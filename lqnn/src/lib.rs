/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Core types shared across the LQNN learned-quantization toolchain.
//!
//! The crates in this workspace split the toolchain by concern:
//!
//! * [`lqnn`](crate): shapes, data types, fused activations, and the common
//!   error type.
//! * `lqnn-quantization`: the LQ codec and the QEM scale optimizer.
//! * `lqnn-graph`: the graph IR and the on-disk model container.
//! * `lqnn-interpreter`: kernels and single-threaded graph execution.
//! * `lqnn-planner`: greedy-by-size tensor arena planning.
//! * `lqnn-trainer`: the post-training quantization driver.
//! * `lqnn-tools`: the `lquantizer` and `output_recorder` binaries.

pub mod activation;
pub mod error;
pub mod shape;
pub mod views;

mod dtype;

pub use activation::Activation;
pub use dtype::DataType;
pub use error::{LqError, LqErrorKind, LqResult};
pub use shape::Shape;

/// Ceiling division for non-negative sizes.
///
/// # Panics
///
/// Panics if `denom == 0`.
pub fn ceil_div(num: usize, denom: usize) -> usize {
    assert!(denom > 0);
    num.div_ceil(denom)
}

#[cfg(test)]
mod tests {
    use super::ceil_div;

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(0, 32), 0);
        assert_eq!(ceil_div(1, 32), 1);
        assert_eq!(ceil_div(32, 32), 1);
        assert_eq!(ceil_div(33, 32), 2);
        assert_eq!(ceil_div(64, 32), 2);
        assert_eq!(ceil_div(1000, 32), 32);
    }
}
