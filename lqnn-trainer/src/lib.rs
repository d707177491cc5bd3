/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The post-training LQ quantization driver.
//!
//! [`Quantizer`] owns the whole flow: load a full-precision model, clone it
//! twice, swap supported fully-connected nodes in the second clone for LQ
//! prototypes, fit weight scales from the FP weights, fit input scales from
//! activations captured while interpreting calibration data, refit them
//! against the FP reference, and write the LQ model out.

pub mod datagen;
pub mod dataset;
pub mod quantizer;

pub use datagen::DataGenerator;
pub use dataset::{DatasetReader, DatasetWriter, RecordTensor};
pub use quantizer::Quantizer;
