/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use lqnn::{DataType, LqError, LqResult, Shape};
use lqnn_graph::{Graph, NodeId, Op, Tensor};
use tracing::trace;

use crate::kernels::{FullyConnectedKernel, LqFullyConnectedKernel};

/// The dtype and shape of a node's output, known at configure time.
#[derive(Debug, Clone)]
pub struct TensorMeta {
    pub dtype: DataType,
    pub shape: Shape,
}

/// Hook invoked after each node's output tensor is written during a run.
///
/// The training drivers attach
/// [`InputSavingObserver`](crate::InputSavingObserver) to harvest
/// activations; everything else uses [`NullObserver`].
pub trait Observer {
    fn post_tensor_write(&mut self, node: NodeId, tensor: &Tensor);
}

/// An observer that ignores every notification.
pub struct NullObserver;

impl Observer for NullObserver {
    fn post_tensor_write(&mut self, _node: NodeId, _tensor: &Tensor) {}
}

#[derive(Debug)]
enum Kernel {
    // Inputs and constants: the tensor is materialized before the run.
    Passthrough,
    FullyConnected(FullyConnectedKernel),
    LqFullyConnected(LqFullyConnectedKernel),
}

/// Single-threaded executor for one graph.
///
/// Construction runs the configure phase over every reachable node: operand
/// validation, output shape inference, scratch allocation. Invariant
/// violations and operators without an evaluator are rejected here, so a
/// constructed interpreter can only fail at run time on an unsupported fused
/// activation.
#[derive(Debug)]
pub struct Interpreter<'g> {
    graph: &'g Graph,
    order: Vec<NodeId>,
    tensors: Vec<Tensor>,
    kernels: Vec<Kernel>,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g Graph) -> LqResult<Self> {
        let order = graph.execution_order()?;

        let placeholder = || Tensor::zeros(DataType::F32, [0usize]);
        let mut metas: Vec<TensorMeta> = (0..graph.len())
            .map(|_| TensorMeta {
                dtype: DataType::F32,
                shape: Shape::from([0usize]),
            })
            .collect();
        let mut tensors: Vec<Tensor> = (0..graph.len()).map(|_| placeholder()).collect();
        let mut kernels: Vec<Kernel> = (0..graph.len()).map(|_| Kernel::Passthrough).collect();

        // Producers precede consumers in the order, so operand metadata is
        // always in place by the time a kernel configures.
        for &id in &order {
            let node = graph.node(id);
            let meta = |operand: NodeId| metas[operand].clone();

            let (kernel, out_meta) = match &node.op {
                Op::Input { dtype, shape } => {
                    tensors[id] = Tensor::zeros(*dtype, shape.clone());
                    (
                        Kernel::Passthrough,
                        TensorMeta {
                            dtype: *dtype,
                            shape: shape.clone(),
                        },
                    )
                }
                Op::Const(tensor) => {
                    tensors[id] = tensor.clone();
                    (
                        Kernel::Passthrough,
                        TensorMeta {
                            dtype: tensor.dtype(),
                            shape: tensor.shape().clone(),
                        },
                    )
                }
                Op::FullyConnected { activation } => {
                    let kernel = FullyConnectedKernel::configure(node, *activation, meta)?;
                    let shape = kernel.output_shape().clone();
                    (
                        Kernel::FullyConnected(kernel),
                        TensorMeta {
                            dtype: DataType::F32,
                            shape,
                        },
                    )
                }
                Op::LqFullyConnected {
                    weights_hidden_size,
                    activation,
                } => {
                    let kernel = LqFullyConnectedKernel::configure(
                        graph,
                        node,
                        *weights_hidden_size,
                        *activation,
                        meta,
                    )?;
                    let shape = kernel.output_shape().clone();
                    (
                        Kernel::LqFullyConnected(kernel),
                        TensorMeta {
                            dtype: DataType::F32,
                            shape,
                        },
                    )
                }
                Op::Custom(op_name) => {
                    return Err(LqError::UnsupportedOperator(format!(
                        "{op_name} (node \"{}\")",
                        node.name
                    )));
                }
            };

            metas[id] = out_meta;
            kernels[id] = kernel;
        }

        Ok(Self {
            graph,
            order,
            tensors,
            kernels,
        })
    }

    /// The graph this interpreter executes.
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Fill an input node's tensor before a run.
    pub fn write_input(&mut self, node: NodeId, data: &[f32]) -> LqResult<()> {
        let op = &self.graph.node(node).op;
        let Op::Input { dtype, shape } = op else {
            return Err(LqError::InvariantViolation(format!(
                "node {} is {}, not an input",
                node,
                op.kind_name()
            )));
        };
        if *dtype != DataType::F32 {
            return Err(LqError::InvariantViolation(format!(
                "input node {node} is {dtype}, only f32 inputs can be written"
            )));
        }
        if data.len() != shape.num_elements() {
            return Err(LqError::InvariantViolation(format!(
                "input node {} takes {} elements, got {}",
                node,
                shape.num_elements(),
                data.len()
            )));
        }
        // The input tensor was allocated as f32 at configure time.
        if let Some(buffer) = self.tensors[node].as_f32_mut() {
            buffer.copy_from_slice(data);
        }
        Ok(())
    }

    /// Execute every node in order, notifying `observer` after each output
    /// tensor is written.
    pub fn run(&mut self, observer: &mut dyn Observer) -> LqResult<()> {
        for idx in 0..self.order.len() {
            let id = self.order[idx];

            let output = match &mut self.kernels[id] {
                Kernel::Passthrough => None,
                Kernel::FullyConnected(kernel) => Some(kernel.execute(&self.tensors)?),
                Kernel::LqFullyConnected(kernel) => Some(kernel.execute(&self.tensors)?),
            };
            if let Some(output) = output {
                trace!(node = id, shape = ?output.shape().dims(), "wrote output tensor");
                self.tensors[id] = output;
            }

            observer.post_tensor_write(id, &self.tensors[id]);
        }
        Ok(())
    }

    /// Read a node's output tensor after a run.
    pub fn read_output(&self, node: NodeId) -> LqResult<&Tensor> {
        if node >= self.tensors.len() {
            return Err(LqError::InvariantViolation(format!(
                "node reference {} out of range ({} nodes)",
                node,
                self.tensors.len()
            )));
        }
        Ok(&self.tensors[node])
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use lqnn::{Activation, LqErrorKind};

    use super::*;

    #[test]
    fn custom_operators_are_rejected_at_configure() {
        let mut graph = Graph::new();
        let input = graph.add_node(
            "input",
            Op::Input {
                dtype: DataType::F32,
                shape: Shape::from([1, 2]),
            },
            vec![],
        );
        let custom = graph.add_node("mystery", Op::Custom("Conv2D".to_string()), vec![input]);
        graph.add_output(custom);

        let err = Interpreter::new(&graph).unwrap_err();
        assert_eq!(err.kind(), LqErrorKind::UnsupportedOperator);
    }

    #[test]
    fn write_input_validates_length_and_kind() {
        let mut graph = Graph::new();
        let input = graph.add_node(
            "input",
            Op::Input {
                dtype: DataType::F32,
                shape: Shape::from([1, 3]),
            },
            vec![],
        );
        let weights = graph.add_node(
            "weights",
            Op::Const(Tensor::f32([1, 3], vec![1.0, 1.0, 1.0]).unwrap()),
            vec![],
        );
        let fc = graph.add_node(
            "fc",
            Op::FullyConnected {
                activation: Activation::None,
            },
            vec![input, weights],
        );
        graph.add_output(fc);

        let mut interp = Interpreter::new(&graph).unwrap();
        assert!(interp.write_input(input, &[1.0, 2.0]).is_err());
        assert!(interp.write_input(weights, &[1.0, 2.0, 3.0]).is_err());
        assert!(interp.write_input(input, &[1.0, 2.0, 3.0]).is_ok());

        interp.run(&mut NullObserver).unwrap();
        assert_eq!(interp.read_output(fc).unwrap().as_f32().unwrap(), &[6.0]);
    }

    #[test]
    fn repeated_runs_reuse_the_interpreter() {
        let mut graph = Graph::new();
        let input = graph.add_node(
            "input",
            Op::Input {
                dtype: DataType::F32,
                shape: Shape::from([1, 2]),
            },
            vec![],
        );
        let weights = graph.add_node(
            "weights",
            Op::Const(Tensor::f32([1, 2], vec![2.0, 3.0]).unwrap()),
            vec![],
        );
        let fc = graph.add_node(
            "fc",
            Op::FullyConnected {
                activation: Activation::None,
            },
            vec![input, weights],
        );
        graph.add_output(fc);

        let mut interp = Interpreter::new(&graph).unwrap();
        for (a, b) in [(1.0f32, 1.0f32), (0.0, 2.0), (-1.0, 1.0)] {
            interp.write_input(input, &[a, b]).unwrap();
            interp.run(&mut NullObserver).unwrap();
            let got = interp.read_output(fc).unwrap().as_f32().unwrap()[0];
            assert_eq!(got, 2.0 * a + 3.0 * b);
        }
    }
}
