/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fused activation functions carried by fully-connected operators.
///
/// The container format can carry every variant; the kernels evaluate the
/// subset listed in [`Activation::evaluate_in_place`] and reject the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    None,
    Relu,
    ReluN1To1,
    Relu6,
    Tanh,
    Sigmoid,
    SignBit,
}

/// Returned when a kernel is asked to evaluate a fused activation it has no
/// implementation for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unsupported fused activation {0:?}")]
pub struct UnsupportedActivation(pub Activation);

impl Activation {
    /// Apply the activation over `data` in place.
    ///
    /// Supported variants are `None`, `Relu`, `Relu6`, `Tanh`, and `Sigmoid`;
    /// anything else fails with [`UnsupportedActivation`].
    pub fn evaluate_in_place(&self, data: &mut [f32]) -> Result<(), UnsupportedActivation> {
        match self {
            Activation::None => {}
            Activation::Relu => {
                for v in data.iter_mut() {
                    *v = v.max(0.0);
                }
            }
            Activation::Relu6 => {
                for v in data.iter_mut() {
                    *v = v.clamp(0.0, 6.0);
                }
            }
            Activation::Tanh => {
                for v in data.iter_mut() {
                    *v = v.tanh();
                }
            }
            Activation::Sigmoid => {
                for v in data.iter_mut() {
                    *v = 1.0 / (1.0 + (-*v).exp());
                }
            }
            Activation::ReluN1To1 | Activation::SignBit => {
                return Err(UnsupportedActivation(*self));
            }
        }
        Ok(())
    }
}

///////////
// Tests //
///////////
