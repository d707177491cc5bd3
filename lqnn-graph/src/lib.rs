/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The graph IR and on-disk model container for the LQNN toolchain.
//!
//! The IR is deliberately small: an operator graph whose nodes reference
//! their producers by id, with constants carried inline as tensors. Two
//! structurally identical clones of the same graph keep identical node ids,
//! which is what the quantization driver relies on to pair full-precision
//! nodes with their LQ replacements.

pub mod graph;
pub mod model;
pub mod tensor;

pub use graph::{Graph, Node, NodeId, Op};
pub use model::Model;
pub use tensor::{Tensor, TensorData};
