/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use lqnn::{DataType, LqError, LqResult, Shape};
use lqnn_graph::{Graph, NodeId, Op};
use serde::Serialize;
use tracing::info;

use crate::greedy::{greedy_by_size, AllocationRequest};
use crate::scratchpad::ScratchpadHelper;

/// Which allocation classes are excluded from arena planning.
///
/// An excluded class plans with size zero: the records keep their intervals
/// (so the plan still shows lifetimes) but occupy no bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanningMode {
    pub null_consts: bool,
    pub null_inputs: bool,
    pub null_scratchpads: bool,
}

/// What a planned record holds: a node's output tensor or a kernel's
/// scratchpad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocationKind {
    Tensor,
    Scratchpad,
}

/// One placed allocation.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAllocation {
    pub node: NodeId,
    pub name: String,
    pub kind: AllocationKind,
    pub size: usize,
    pub first_use: usize,
    pub last_use: usize,
    pub breadth: usize,
    pub offset: usize,
}

/// The finished plan: execution order, placed allocations, and the arena
/// size they need.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub order: Vec<NodeId>,
    pub allocations: Vec<PlannedAllocation>,
    pub required_size: usize,
}

impl ExecutionPlan {
    /// Render the plan as JSON for offline inspection.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Computes execution order, live intervals, and arena offsets for a graph.
///
/// The scratchpad helper is a constructor argument: callers pick the target
/// platform explicitly instead of configuring a process-wide registry.
pub struct ExecutionPlanner<'g> {
    graph: &'g Graph,
    scratchpad_helper: Box<dyn ScratchpadHelper>,
    mode: PlanningMode,
}

impl<'g> ExecutionPlanner<'g> {
    pub fn new(graph: &'g Graph, scratchpad_helper: Box<dyn ScratchpadHelper>) -> Self {
        Self {
            graph,
            scratchpad_helper,
            mode: PlanningMode::default(),
        }
    }

    /// Exclude allocation classes from planning; see [`PlanningMode`].
    pub fn change_planning_mode(&mut self, mode: PlanningMode) {
        self.mode = mode;
    }

    /// Compute the plan.
    ///
    /// Tensor lifetimes run from the producer's tick to just past the last
    /// consumer's tick (graph outputs live to the end), so an operand and
    /// the output overwriting it at the same tick never share bytes.
    /// Scratchpads live only for their node's own tick.
    pub fn make_plan(&self) -> LqResult<ExecutionPlan> {
        let order = self.graph.execution_order()?;
        let sizes = self.output_byte_sizes(&order)?;

        // Position of each node in the execution order.
        let mut position = vec![usize::MAX; self.graph.len()];
        for (tick, &id) in order.iter().enumerate() {
            position[id] = tick;
        }

        // Live interval per node: [own tick, one past the last consumer].
        let mut last_use: Vec<usize> = order.iter().map(|&id| position[id] + 1).collect();
        for &id in &order {
            for &operand in &self.graph.node(id).inputs {
                let operand_slot = order.iter().position(|&n| n == operand).unwrap_or(0);
                last_use[operand_slot] = last_use[operand_slot].max(position[id] + 1);
            }
        }
        for &output in self.graph.outputs() {
            if position[output] != usize::MAX {
                let slot = order.iter().position(|&n| n == output).unwrap_or(0);
                last_use[slot] = last_use[slot].max(order.len());
            }
        }

        let mut requests = Vec::with_capacity(order.len());
        let mut entries = Vec::with_capacity(order.len());

        for (slot, &id) in order.iter().enumerate() {
            let node = self.graph.node(id);
            let size = match &node.op {
                Op::Const(_) if self.mode.null_consts => 0,
                Op::Input { .. } if self.mode.null_inputs => 0,
                _ => sizes[slot],
            };
            requests.push(AllocationRequest {
                node: id,
                size,
                first_use: position[id],
                last_use: last_use[slot],
            });
            entries.push((id, node.name.clone(), AllocationKind::Tensor));

            let scratch = if self.mode.null_scratchpads {
                0
            } else {
                self.scratchpad_helper.scratchpad_size(self.graph, id)
            };
            if scratch > 0 {
                requests.push(AllocationRequest {
                    node: id,
                    size: scratch,
                    first_use: position[id],
                    last_use: position[id] + 1,
                });
                entries.push((id, format!("{}/scratchpad", node.name), AllocationKind::Scratchpad));
            }
        }

        let plan = greedy_by_size(&requests);

        let allocations = entries
            .into_iter()
            .zip(requests.iter())
            .enumerate()
            .map(|(i, ((node, name, kind), request))| PlannedAllocation {
                node,
                name,
                kind,
                size: request.size,
                first_use: request.first_use,
                last_use: request.last_use,
                breadth: plan.breadths[i],
                offset: plan.offsets[i],
            })
            .collect();

        info!(
            nodes = order.len(),
            required_size = plan.required_size,
            "computed execution plan"
        );

        Ok(ExecutionPlan {
            order,
            allocations,
            required_size: plan.required_size,
        })
    }

    // Infer the output byte size of every node, in execution order.
    fn output_byte_sizes(&self, order: &[NodeId]) -> LqResult<Vec<usize>> {
        let mut shapes: Vec<Option<(DataType, Shape)>> = vec![None; self.graph.len()];
        let mut sizes = Vec::with_capacity(order.len());

        for &id in order {
            let node = self.graph.node(id);
            let meta = match &node.op {
                Op::Input { dtype, shape } => (*dtype, shape.clone()),
                Op::Const(tensor) => (tensor.dtype(), tensor.shape().clone()),
                Op::FullyConnected { .. } => {
                    let input = self.rank2_shape(&shapes, node.inputs.first(), &node.name)?;
                    let weights = self.rank2_shape(&shapes, node.inputs.get(1), &node.name)?;
                    (DataType::F32, Shape::from([input.dim(0), weights.dim(0)]))
                }
                Op::LqFullyConnected { .. } => {
                    let input = self.rank2_shape(&shapes, node.inputs.first(), &node.name)?;
                    let planes = node
                        .inputs
                        .get(3)
                        .and_then(|id| shapes[*id].clone())
                        .ok_or_else(|| {
                            LqError::InvariantViolation(format!(
                                "\"{}\": missing weights_binary operand",
                                node.name
                            ))
                        })?;
                    (DataType::F32, Shape::from([input.dim(0), planes.1.dim(0)]))
                }
                Op::Custom(op_name) => {
                    return Err(LqError::UnsupportedOperator(format!(
                        "{op_name} (node \"{}\") cannot be planned",
                        node.name
                    )));
                }
            };
            sizes.push(meta.1.num_elements() * meta.0.size());
            shapes[id] = Some(meta);
        }

        Ok(sizes)
    }

    fn rank2_shape(
        &self,
        shapes: &[Option<(DataType, Shape)>],
        operand: Option<&NodeId>,
        name: &str,
    ) -> LqResult<Shape> {
        let shape = operand
            .and_then(|id| shapes.get(*id))
            .and_then(|meta| meta.as_ref())
            .map(|(_, shape)| shape.clone())
            .ok_or_else(|| {
                LqError::InvariantViolation(format!("\"{name}\": missing operand shape"))
            })?;
        if shape.rank() != 2 {
            return Err(LqError::InvariantViolation(format!(
                "\"{name}\": expected a rank-2 operand, got rank {}",
                shape.rank()
            )));
        }
        Ok(shape)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use lqnn::Activation;
    use lqnn_graph::Tensor;

    use super::*;
    use crate::scratchpad::{scratchpad_helper_for, TargetPlatform};

    // input(1x4) -> fc0(1x3) -> fc1(1x2), biasless.
    fn chain() -> Graph {
        let mut graph = Graph::new();
        let input = graph.add_node(
            "input",
            Op::Input {
                dtype: DataType::F32,
                shape: Shape::from([1, 4]),
            },
            vec![],
        );
        let w0 = graph.add_node(
            "w0",
            Op::Const(Tensor::f32([3, 4], vec![0.5; 12]).unwrap()),
            vec![],
        );
        let fc0 = graph.add_node(
            "fc0",
            Op::FullyConnected {
                activation: Activation::None,
            },
            vec![input, w0],
        );
        let w1 = graph.add_node(
            "w1",
            Op::Const(Tensor::f32([2, 3], vec![0.5; 6]).unwrap()),
            vec![],
        );
        let fc1 = graph.add_node(
            "fc1",
            Op::FullyConnected {
                activation: Activation::None,
            },
            vec![fc0, w1],
        );
        graph.add_output(fc1);
        graph
    }

    fn allocation<'p>(plan: &'p ExecutionPlan, node: NodeId) -> &'p PlannedAllocation {
        plan.allocations
            .iter()
            .find(|a| a.node == node && a.kind == AllocationKind::Tensor)
            .unwrap()
    }

    #[test]
    fn plan_covers_every_node_without_collisions() {
        let graph = chain();
        let planner =
            ExecutionPlanner::new(&graph, scratchpad_helper_for(TargetPlatform::Linux));
        let plan = planner.make_plan().unwrap();

        assert_eq!(plan.order.len(), 5);
        assert_eq!(plan.allocations.len(), 5);
        assert!(plan.required_size > 0);

        // Operands and outputs alive together must not share bytes.
        for a in &plan.allocations {
            for b in &plan.allocations {
                if std::ptr::eq(a, b) {
                    continue;
                }
                let overlap_in_time = a.first_use < b.last_use && b.first_use < a.last_use;
                if overlap_in_time && a.size > 0 && b.size > 0 {
                    let disjoint = a.offset + a.size <= b.offset || b.offset + b.size <= a.offset;
                    assert!(disjoint, "{} and {} share bytes", a.name, b.name);
                }
            }
        }

        // fc0's output is consumed by fc1; their byte ranges must differ.
        let fc0 = allocation(&plan, 2);
        let fc1 = allocation(&plan, 4);
        assert!(
            fc0.offset + fc0.size <= fc1.offset || fc1.offset + fc1.size <= fc0.offset
        );
    }

    #[test]
    fn null_modes_zero_their_classes() {
        let graph = chain();
        let mut planner =
            ExecutionPlanner::new(&graph, scratchpad_helper_for(TargetPlatform::Linux));
        planner.change_planning_mode(PlanningMode {
            null_consts: true,
            null_inputs: true,
            null_scratchpads: false,
        });
        let plan = planner.make_plan().unwrap();

        assert_eq!(allocation(&plan, 0).size, 0); // input
        assert_eq!(allocation(&plan, 1).size, 0); // w0
        assert!(allocation(&plan, 2).size > 0); // fc0 output

        // Only the two FC outputs count: fc0 (1x3) and fc1 (1x2) overlap at
        // the hand-off, so the arena holds both.
        assert_eq!(plan.required_size, 12 + 8);
    }

    #[test]
    fn custom_nodes_cannot_be_planned() {
        let mut graph = Graph::new();
        let input = graph.add_node(
            "input",
            Op::Input {
                dtype: DataType::F32,
                shape: Shape::from([1, 4]),
            },
            vec![],
        );
        let custom = graph.add_node("conv", Op::Custom("Conv2D".to_string()), vec![input]);
        graph.add_output(custom);

        let planner =
            ExecutionPlanner::new(&graph, scratchpad_helper_for(TargetPlatform::Linux));
        let err = planner.make_plan().unwrap_err();
        assert_eq!(err.kind(), lqnn::LqErrorKind::UnsupportedOperator);
    }

    #[test]
    fn plan_serializes_to_json() {
        let graph = chain();
        let planner =
            ExecutionPlanner::new(&graph, scratchpad_helper_for(TargetPlatform::Linux));
        let plan = planner.make_plan().unwrap();
        let json = plan.to_json().unwrap();
        assert!(json.contains("required_size"));
        assert!(json.contains("fc0"));
    }
}
