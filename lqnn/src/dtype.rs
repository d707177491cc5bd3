/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use serde::{Deserialize, Serialize};

/// The element types that tensors in this toolchain can carry.
///
/// The LQ path only deals with 32-bit floats (activations, scales, biases)
/// and 32-bit integers (packed bitplanes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    S32,
}

impl DataType {
    /// Size in bytes of a single element.
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::F32 => write!(f, "f32"),
            DataType::S32 => write!(f, "s32"),
        }
    }
}
