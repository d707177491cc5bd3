/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use lqnn::{Activation, DataType, LqError, LqResult, Shape};
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Index of a node within its [`Graph`].
pub type NodeId = usize;

/// The operator set the toolchain understands.
///
/// Fully-connected inputs are positional: `[input, weights]` or
/// `[input, weights, bias]` for the full-precision form and
/// `[input, input_scales, weights_scales, weights_binary]` (optionally
/// followed by `bias`) for the LQ form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// A graph input; its tensor is written by the caller before execution.
    Input { dtype: DataType, shape: Shape },

    /// A constant carried inline.
    Const(Tensor),

    /// Full-precision fully-connected.
    FullyConnected { activation: Activation },

    /// Learned-quantization fully-connected.
    LqFullyConnected {
        weights_hidden_size: usize,
        activation: Activation,
    },

    /// An operator this toolchain has no evaluator for; kept so imported
    /// models round-trip, rejected at configure time.
    Custom(String),
}

impl Op {
    /// A short display name for diagnostics.
    pub fn kind_name(&self) -> &str {
        match self {
            Op::Input { .. } => "Input",
            Op::Const(_) => "Const",
            Op::FullyConnected { .. } => "FullyConnected",
            Op::LqFullyConnected { .. } => "LQFullyConnected",
            Op::Custom(name) => name,
        }
    }
}

/// One operator instance: its op, display name, and producer references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<NodeId>,
}

/// An operator graph.
///
/// Nodes are stored in insertion order and referenced by index; `Clone`
/// preserves ids, so two clones of the same graph stay structurally parallel
/// node-for-node. Execution order is a stable postorder walk from the
/// outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its id.
    pub fn add_node(&mut self, name: impl Into<String>, op: Op, inputs: Vec<NodeId>) -> NodeId {
        let id = self.nodes.len();
        if matches!(op, Op::Input { .. }) {
            self.inputs.push(id);
        }
        self.nodes.push(Node {
            name: name.into(),
            op,
            inputs,
        });
        id
    }

    /// Mark `id` as a graph output.
    pub fn add_output(&mut self, id: NodeId) {
        self.outputs.push(id);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    /// Graph input node ids in declaration order.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Graph output node ids in declaration order.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// The constant tensor of node `id`, if it is a `Const`.
    pub fn const_tensor(&self, id: NodeId) -> Option<&Tensor> {
        match &self.node(id).op {
            Op::Const(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// Mutable access to the constant tensor of node `id`.
    pub fn const_tensor_mut(&mut self, id: NodeId) -> Option<&mut Tensor> {
        match &mut self.node_mut(id).op {
            Op::Const(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// A stable postorder traversal from the outputs: every producer appears
    /// before its consumers, unreachable nodes are skipped, and the order is
    /// identical for structurally identical graphs.
    ///
    /// Fails with an invariant violation on dangling references or cycles.
    pub fn execution_order(&self) -> LqResult<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());

        // Iterative DFS; the `expanded` flag distinguishes the first visit
        // from the post-children visit.
        let mut stack: Vec<(NodeId, bool)> =
            self.outputs.iter().rev().map(|id| (*id, false)).collect();

        while let Some((id, expanded)) = stack.pop() {
            if id >= self.nodes.len() {
                return Err(LqError::InvariantViolation(format!(
                    "node reference {} out of range ({} nodes)",
                    id,
                    self.nodes.len()
                )));
            }
            if expanded {
                marks[id] = Mark::Done;
                order.push(id);
                continue;
            }
            match marks[id] {
                Mark::Done => continue,
                Mark::InProgress => {
                    return Err(LqError::InvariantViolation(format!(
                        "cycle through node {} (\"{}\")",
                        id,
                        self.nodes[id].name
                    )));
                }
                Mark::Unvisited => {
                    marks[id] = Mark::InProgress;
                    stack.push((id, true));
                    for input in self.nodes[id].inputs.iter().rev() {
                        if marks.get(*input) != Some(&Mark::Done) {
                            stack.push((*input, false));
                        }
                    }
                }
            }
        }

        Ok(order)
    }
}

///////////
// Tests //
///////////
