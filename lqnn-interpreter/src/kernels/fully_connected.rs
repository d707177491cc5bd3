/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use lqnn::{Activation, DataType, LqResult, Shape};
use lqnn_graph::{Node, NodeId, Tensor};

use crate::interpreter::TensorMeta;
use crate::kernels::check;

/// The full-precision fully-connected kernel.
///
/// This is the reference path the training drivers run to capture ground
/// truth activations; the LQ clone replaces these nodes where it can.
#[derive(Debug)]
pub struct FullyConnectedKernel {
    input: NodeId,
    weights: NodeId,
    bias: Option<NodeId>,
    activation: Activation,
    output_shape: Shape,
}

impl FullyConnectedKernel {
    /// Validate operand shapes and infer the output shape.
    ///
    /// Inputs are positional: `[input, weights]` or `[input, weights, bias]`.
    /// Only rank-2 inputs and weights are supported.
    pub fn configure(
        node: &Node,
        activation: Activation,
        meta: impl Fn(NodeId) -> TensorMeta,
    ) -> LqResult<Self> {
        let name = &node.name;
        check(
            node.inputs.len() == 2 || node.inputs.len() == 3,
            || format!("\"{name}\": FullyConnected takes 2 or 3 inputs, got {}", node.inputs.len()),
        )?;

        let input = node.inputs[0];
        let weights = node.inputs[1];
        let bias = node.inputs.get(2).copied();

        let input_meta = meta(input);
        let weights_meta = meta(weights);

        check(input_meta.dtype == DataType::F32, || {
            format!("\"{name}\": input must be f32, got {}", input_meta.dtype)
        })?;
        check(weights_meta.dtype == DataType::F32, || {
            format!("\"{name}\": weights must be f32, got {}", weights_meta.dtype)
        })?;
        check(input_meta.shape.rank() == 2, || {
            format!(
                "\"{name}\": input rank must be 2, got {}",
                input_meta.shape.rank()
            )
        })?;
        check(weights_meta.shape.rank() == 2, || {
            format!(
                "\"{name}\": weights rank must be 2, got {}",
                weights_meta.shape.rank()
            )
        })?;
        check(
            input_meta.shape.dim(1) == weights_meta.shape.dim(1),
            || {
                format!(
                    "\"{name}\": input depth {} does not match weights depth {}",
                    input_meta.shape.dim(1),
                    weights_meta.shape.dim(1)
                )
            },
        )?;

        let output_size = weights_meta.shape.dim(0);
        if let Some(bias) = bias {
            let bias_meta = meta(bias);
            check(bias_meta.dtype == DataType::F32, || {
                format!("\"{name}\": bias must be f32, got {}", bias_meta.dtype)
            })?;
            check(bias_meta.shape.num_elements() == output_size, || {
                format!(
                    "\"{name}\": bias has {} elements, expected {}",
                    bias_meta.shape.num_elements(),
                    output_size
                )
            })?;
        }

        Ok(Self {
            input,
            weights,
            bias,
            activation,
            output_shape: Shape::from([input_meta.shape.dim(0), output_size]),
        })
    }

    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    /// Run the matmul, add the bias, and apply the fused activation.
    ///
    /// `tensors` is the per-node tensor store; configure has already proven
    /// the operand types and shapes.
    pub fn execute(&self, tensors: &[Tensor]) -> LqResult<Tensor> {
        let input = tensors[self.input].as_f32().unwrap();
        let weights = tensors[self.weights].as_f32().unwrap();
        let bias = self.bias.map(|id| tensors[id].as_f32().unwrap());

        let batches = self.output_shape.dim(0);
        let output_size = self.output_shape.dim(1);
        let hidden_size = tensors[self.weights].shape().dim(1);

        let mut output = Tensor::zeros(DataType::F32, self.output_shape.clone());
        let out = output.as_f32_mut().unwrap();

        for batch in 0..batches {
            let in_row = &input[batch * hidden_size..(batch + 1) * hidden_size];
            let out_row = &mut out[batch * output_size..(batch + 1) * output_size];

            for (o, out_value) in out_row.iter_mut().enumerate() {
                let w_row = &weights[o * hidden_size..(o + 1) * hidden_size];
                let mut acc = 0.0f32;
                for (x, w) in std::iter::zip(in_row.iter(), w_row.iter()) {
                    acc += x * w;
                }
                *out_value = acc;
            }

            if let Some(bias) = bias {
                for (out_value, b) in std::iter::zip(out_row.iter_mut(), bias.iter()) {
                    *out_value += b;
                }
            }
        }

        self.activation.evaluate_in_place(out)?;
        Ok(output)
    }
}

///////////
// Tests //
///////////
