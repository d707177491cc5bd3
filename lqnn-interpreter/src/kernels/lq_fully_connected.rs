/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use lqnn::{ceil_div, Activation, DataType, LqError, LqResult, Shape};
use lqnn_graph::{Graph, Node, NodeId, Tensor};
use lqnn_quantization::LqCodec;

use crate::interpreter::TensorMeta;
use crate::kernels::check;

/// The learned-quantization fully-connected kernel.
///
/// Weights arrive pre-packed as `[output_size, Kw, ceil(H/32)]` sign planes
/// with per-neuron scale rows; the input row is packed on the fly by a
/// scratch [`LqCodec`] sized at configure time. The inner product is then a
/// XNOR+popcount accumulation weighted by the products of scale pairs.
#[derive(Debug)]
pub struct LqFullyConnectedKernel {
    input: NodeId,
    input_scales: NodeId,
    weights_scales: NodeId,
    weights_binary: NodeId,
    bias: Option<NodeId>,
    activation: Activation,
    hidden_size: usize,
    codec: LqCodec,
    output_shape: Shape,
}

impl LqFullyConnectedKernel {
    /// Validate every shape/dtype/bit-width invariant and allocate the input
    /// packing scratch.
    ///
    /// Inputs are positional:
    /// `[input, input_scales, weights_scales, weights_binary]`, optionally
    /// followed by `bias`. `input_scales` must be a constant; its values
    /// seed the scratch codec.
    pub fn configure(
        graph: &Graph,
        node: &Node,
        weights_hidden_size: usize,
        activation: Activation,
        meta: impl Fn(NodeId) -> TensorMeta,
    ) -> LqResult<Self> {
        let name = &node.name;
        check(
            node.inputs.len() == 4 || node.inputs.len() == 5,
            || {
                format!(
                    "\"{name}\": LQFullyConnected takes 4 or 5 inputs, got {}",
                    node.inputs.len()
                )
            },
        )?;

        let input = node.inputs[0];
        let input_scales = node.inputs[1];
        let weights_scales = node.inputs[2];
        let weights_binary = node.inputs[3];
        let bias = node.inputs.get(4).copied();

        let input_meta = meta(input);
        let is_meta = meta(input_scales);
        let ws_meta = meta(weights_scales);
        let wb_meta = meta(weights_binary);

        // Data types.
        check(input_meta.dtype == DataType::F32, || {
            format!("\"{name}\": input must be f32, got {}", input_meta.dtype)
        })?;
        check(is_meta.dtype == DataType::F32, || {
            format!("\"{name}\": input_scales must be f32, got {}", is_meta.dtype)
        })?;
        check(ws_meta.dtype == DataType::F32, || {
            format!("\"{name}\": weights_scales must be f32, got {}", ws_meta.dtype)
        })?;
        check(wb_meta.dtype == DataType::S32, || {
            format!("\"{name}\": weights_binary must be s32, got {}", wb_meta.dtype)
        })?;

        // Weight plane geometry.
        check(ws_meta.shape.rank() == 2, || {
            format!(
                "\"{name}\": weights_scales rank must be 2, got {}",
                ws_meta.shape.rank()
            )
        })?;
        check(wb_meta.shape.rank() == 3, || {
            format!(
                "\"{name}\": weights_binary rank must be 3, got {}",
                wb_meta.shape.rank()
            )
        })?;
        check(wb_meta.shape.dim(0) == ws_meta.shape.dim(0), || {
            format!(
                "\"{name}\": weights_binary has {} neurons, weights_scales has {}",
                wb_meta.shape.dim(0),
                ws_meta.shape.dim(0)
            )
        })?;
        check(wb_meta.shape.dim(1) == ws_meta.shape.dim(1), || {
            format!(
                "\"{name}\": weights_binary has {} planes, weights_scales has {}",
                wb_meta.shape.dim(1),
                ws_meta.shape.dim(1)
            )
        })?;
        check(
            wb_meta.shape.dim(2) == ceil_div(weights_hidden_size, 32),
            || {
                format!(
                    "\"{name}\": weights_binary has {} words per plane, expected {}",
                    wb_meta.shape.dim(2),
                    ceil_div(weights_hidden_size, 32)
                )
            },
        )?;

        // Encoding widths stay below the plane word width.
        check(is_meta.shape.rank() == 1, || {
            format!(
                "\"{name}\": input_scales rank must be 1, got {}",
                is_meta.shape.rank()
            )
        })?;
        check(is_meta.shape.dim(0) < 32, || {
            format!(
                "\"{name}\": input encoding bits must be < 32, got {}",
                is_meta.shape.dim(0)
            )
        })?;
        check(ws_meta.shape.dim(1) < 32, || {
            format!(
                "\"{name}\": weight encoding bits must be < 32, got {}",
                ws_meta.shape.dim(1)
            )
        })?;

        // The multiplication itself.
        check(input_meta.shape.rank() == 2, || {
            format!(
                "\"{name}\": input rank must be 2, got {}",
                input_meta.shape.rank()
            )
        })?;
        check(input_meta.shape.dim(1) == weights_hidden_size, || {
            format!(
                "\"{name}\": input depth {} does not match weights_hidden_size {}",
                input_meta.shape.dim(1),
                weights_hidden_size
            )
        })?;

        let output_size = wb_meta.shape.dim(0);
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

        // The scratch codec packs one input row; its scales are the
        // constant input_scales values.
        let scales = graph
            .const_tensor(input_scales)
            .and_then(Tensor::as_f32)
            .ok_or_else(|| {
                LqError::InvariantViolation(format!(
                    "\"{name}\": input_scales must be a f32 constant"
                ))
            })?;
        let codec = LqCodec::new(weights_hidden_size, scales)
            .map_err(|e| LqError::InvariantViolation(format!("\"{name}\": {e}")))?;

        Ok(Self {
            input,
            input_scales,
            weights_scales,
            weights_binary,
            bias,
            activation,
            hidden_size: weights_hidden_size,
            codec,
            output_shape: Shape::from([input_meta.shape.dim(0), output_size]),
        })
    }

    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    /// Run the popcount matmul, add the bias, and apply the fused
    /// activation.
    pub fn execute(&mut self, tensors: &[Tensor]) -> LqResult<Tensor> {
        // Operand dtypes and shapes were proven at configure time.
        let input = tensors[self.input].as_f32().unwrap();
        let input_scales = tensors[self.input_scales].as_f32().unwrap();
        let weights_scales = tensors[self.weights_scales].as_f32().unwrap();
        let weights_binary = tensors[self.weights_binary].as_s32().unwrap();
        let bias = self.bias.map(|id| tensors[id].as_f32().unwrap());

        let batches = self.output_shape.dim(0);
        let output_size = self.output_shape.dim(1);
        let hidden_size = self.hidden_size;
        let input_bits = input_scales.len();
        let weight_bits = tensors[self.weights_scales].shape().dim(1);
        let words = ceil_div(hidden_size, 32);

        let mut output = Tensor::zeros(DataType::F32, self.output_shape.clone());
        let out = output.as_f32_mut().unwrap();

        for batch in 0..batches {
            self.codec
                .quantize(&input[batch * hidden_size..(batch + 1) * hidden_size]);
            let input_binary = self.codec.planes();

            let out_row = &mut out[batch * output_size..(batch + 1) * output_size];
            for (o, out_value) in out_row.iter_mut().enumerate() {
                let mut acc = 0.0f32;

                for bi in 0..input_bits {
                    let inp_scale = input_scales[bi];
                    let inp_line = &input_binary[bi * words..(bi + 1) * words];

                    for bw in 0..weight_bits {
                        let w_offset = o * weight_bits + bw;
                        let w_scale = weights_scales[w_offset];
                        let w_line = &weights_binary[w_offset * words..(w_offset + 1) * words];

                        acc += inp_scale * w_scale * bin_dot(hidden_size, inp_line, w_line) as f32;
                    }
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

/// Signed dot product of two packed ±1 vectors of logical length
/// `hidden_size`.
///
/// Tail bits past `hidden_size` are zero in both operands, so the XNOR
/// counts each of them as a spurious agreement; starting `positives` at
/// `hidden_size - 32 * words` cancels exactly that surplus. With zero tail
/// padding on both sides this is the only correction needed.
fn bin_dot(hidden_size: usize, input_line: &[u32], weight_line: &[i32]) -> i32 {
    let words = input_line.len();
    debug_assert_eq!(words, weight_line.len());

    let mut positives = hidden_size as i32 - 32 * words as i32;
    for (a, b) in std::iter::zip(input_line.iter(), weight_line.iter()) {
        positives += (!(a ^ *b as u32)).count_ones() as i32;
    }
    2 * positives - hidden_size as i32
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use lqnn::LqErrorKind;
    use lqnn_graph::Op;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::interpreter::Interpreter;
    use crate::NullObserver;

    // Pack a ±1 sign vector into plane words with zero tail padding.
    fn pack_signs(signs: &[i8]) -> Vec<u32> {
        let mut words = vec![0u32; ceil_div(signs.len(), 32)];
        for (i, sign) in signs.iter().enumerate() {
            if *sign > 0 {
                words[i >> 5] |= 1 << (i & 31);
            }
        }
        words
    }

    #[test]
    fn popcount_dot_matches_reference() {
        let mut rng = StdRng::seed_from_u64(0xe41bb2d7905c86f3);
        for len in [1usize, 5, 31, 32, 33, 64, 100] {
            let a: Vec<i8> = (0..len).map(|_| if rng.random::<bool>() { 1 } else { -1 }).collect();
            let b: Vec<i8> = (0..len).map(|_| if rng.random::<bool>() { 1 } else { -1 }).collect();

            let expected: i32 = std::iter::zip(a.iter(), b.iter())
                .map(|(x, y)| i32::from(*x) * i32::from(*y))
                .sum();

            let a_packed = pack_signs(&a);
            let b_packed: Vec<i32> = pack_signs(&b).iter().map(|w| *w as i32).collect();
            assert_eq!(
                bin_dot(len, &a_packed, &b_packed),
                expected,
                "popcount dot disagrees with the reference at length {}",
                len
            );
        }
    }

    struct LqFixture {
        input_shape: [usize; 2],
        input_scales: Vec<f32>,
        weights_scales: (Vec<usize>, Vec<f32>),
        weights_binary: (Vec<usize>, Vec<i32>),
        bias: Option<Vec<f32>>,
        activation: Activation,
        hidden_size: usize,
    }

    fn build(case: LqFixture) -> lqnn_graph::Graph {
        let mut graph = lqnn_graph::Graph::new();
        let input = graph.add_node(
            "input",
            Op::Input {
                dtype: DataType::F32,
                shape: Shape::new(case.input_shape.to_vec()),
            },
            vec![],
        );
        let input_scales = graph.add_node(
            "fc/input_scales",
            Op::Const(Tensor::f32([case.input_scales.len()], case.input_scales).unwrap()),
            vec![],
        );
        let weights_scales = graph.add_node(
            "fc/weights_scales",
            Op::Const(Tensor::f32(case.weights_scales.0.as_slice(), case.weights_scales.1).unwrap()),
            vec![],
        );
        let weights_binary = graph.add_node(
            "fc/weights_binary",
            Op::Const(Tensor::s32(case.weights_binary.0.as_slice(), case.weights_binary.1).unwrap()),
            vec![],
        );
        let mut inputs = vec![input, input_scales, weights_scales, weights_binary];
        if let Some(bias) = case.bias {
            let bias = graph.add_node(
                "fc/bias",
                Op::Const(Tensor::f32([bias.len()], bias).unwrap()),
                vec![],
            );
            inputs.push(bias);
        }
        let fc = graph.add_node(
            "fc/LQFullyConnected",
            Op::LqFullyConnected {
                weights_hidden_size: case.hidden_size,
                activation: case.activation,
            },
            inputs,
        );
        graph.add_output(fc);
        graph
    }

    fn reference_case(bias: Option<Vec<f32>>, activation: Activation) -> LqFixture {
        LqFixture {
            input_shape: [1, 5],
            input_scales: vec![0.12, 1.7],
            weights_scales: (
                vec![4, 3],
                vec![
                    0.11, 0.23, 0.31, // neuron 0
                    0.23, 0.41, 0.53, // neuron 1
                    0.13, 0.22, 0.46, // neuron 2
                    0.32, 0.33, 0.35, // neuron 3
                ],
            ),
            weights_binary: (
                vec![4, 3, 1],
                vec![
                    7, 13, 20, // neuron 0
                    4, 15, 3, // neuron 1
                    31, 17, 11, // neuron 2
                    22, 19, 2, // neuron 3
                ],
            ),
            bias,
            activation,
            hidden_size: 5,
        }
    }

    fn run_one(graph: &lqnn_graph::Graph, input: &[f32]) -> Vec<f32> {
        let mut interp = Interpreter::new(graph).unwrap();
        interp.write_input(graph.inputs()[0], input).unwrap();
        interp.run(&mut NullObserver).unwrap();
        interp
            .read_output(graph.outputs()[0])
            .unwrap()
            .as_f32()
            .unwrap()
            .to_vec()
    }

    fn assert_all_near(got: &[f32], want: &[f32], tolerance: f32) {
        assert_eq!(got.len(), want.len());
        for (i, (g, w)) in std::iter::zip(got.iter(), want.iter()).enumerate() {
            assert!(
                (g - w).abs() <= tolerance,
                "output {} is {}, expected {} +/- {}",
                i,
                g,
                w,
                tolerance
            );
        }
    }

    #[test]
    fn simple_with_bias() {
        let graph = build(reference_case(
            Some(vec![-1.1, -5.0, -0.3, 2.8]),
            Activation::None,
        ));
        let out = run_one(&graph, &[0.5, 1.2, 2.3, -1.0, 0.0]);
        assert_all_near(&out, &[-0.2014, -0.1546, 0.1526, 4.2936], 1e-3);
    }

    #[test]
    fn simple_without_bias_relu() {
        let graph = build(reference_case(None, Activation::Relu));
        let out = run_one(&graph, &[0.5, 1.2, 2.3, -1.0, 0.0]);
        assert_all_near(&out, &[0.8986, 4.8454, 0.4526, 1.4936], 1e-3);
    }

    #[test]
    fn one_bit_exact_weights_reproduce_sign_matmul() {
        // K = 1 with unit scales and exact ±1 weights: the LQ path computes
        // sign(input) · W exactly.
        let signs: Vec<i8> = vec![1, -1, 1, 1, -1, 1, -1, -1];
        let word = pack_signs(&signs)[0] as i32;

        let graph = build(LqFixture {
            input_shape: [1, 8],
            input_scales: vec![1.0],
            weights_scales: (vec![1, 1], vec![1.0]),
            weights_binary: (vec![1, 1, 1], vec![word]),
            bias: None,
            activation: Activation::None,
            hidden_size: 8,
        });

        let input: [f32; 8] = [0.5, 0.25, -0.75, 2.0, 1.0, -0.5, 3.0, -2.0];
        let expected: f32 = std::iter::zip(input.iter(), signs.iter())
            .map(|(x, s)| x.signum() * f32::from(*s))
            .sum();

        let out = run_one(&graph, &input);
        assert_all_near(&out, &[expected], 1e-6);
    }

    #[test]
    fn mismatched_plane_shapes_fail_configure() {
        // weights_binary [3, 2, 1] against weights_scales [4, 3].
        let mut case = reference_case(None, Activation::Relu);
        case.weights_binary = (vec![3, 2, 1], vec![7, 13, 4, 15, 31, 17]);
        let graph = build(case);
        let err = Interpreter::new(&graph).unwrap_err();
        assert_eq!(err.kind(), LqErrorKind::InvariantViolation);
    }

    #[test]
    fn rank3_input_fails_configure() {
        let mut graph = lqnn_graph::Graph::new();
        let input = graph.add_node(
            "input",
            Op::Input {
                dtype: DataType::F32,
                shape: Shape::from([1, 2, 5]),
            },
            vec![],
        );
        let input_scales = graph.add_node(
            "fc/input_scales",
            Op::Const(Tensor::f32([2], vec![0.12, 1.7]).unwrap()),
            vec![],
        );
        let weights_scales = graph.add_node(
            "fc/weights_scales",
            Op::Const(Tensor::f32([4, 3], vec![0.25; 12]).unwrap()),
            vec![],
        );
        let weights_binary = graph.add_node(
            "fc/weights_binary",
            Op::Const(Tensor::s32([4, 3, 1], vec![7; 12]).unwrap()),
            vec![],
        );
        let fc = graph.add_node(
            "fc/LQFullyConnected",
            Op::LqFullyConnected {
                weights_hidden_size: 5,
                activation: Activation::Relu,
            },
            vec![input, input_scales, weights_scales, weights_binary],
        );
        graph.add_output(fc);

        let err = Interpreter::new(&graph).unwrap_err();
        assert_eq!(err.kind(), LqErrorKind::InvariantViolation);
    }

    #[test]
    fn unsupported_activation_fails_execute() {
        let graph = build(reference_case(None, Activation::SignBit));
        let mut interp = Interpreter::new(&graph).unwrap();
        interp
            .write_input(graph.inputs()[0], &[0.5, 1.2, 2.3, -1.0, 0.0])
            .unwrap();
        let err = interp.run(&mut NullObserver).unwrap_err();
        assert_eq!(err.kind(), LqErrorKind::UnsupportedActivation);
    }
}
