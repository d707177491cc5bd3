/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Per-platform scratchpad sizing.
//!
//! Some kernels need working memory beyond their output tensor; for this
//! operator set that is the LQ fully-connected input packing buffer
//! (`Ki * ceil(H/32)` plane words). Whether that buffer lives in the arena
//! depends on the target: hosted builds allocate it on the heap, embedded
//! targets plan it alongside the tensors.

use lqnn::ceil_div;
use lqnn_graph::{Graph, NodeId, Op};

/// The deployment target the plan is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPlatform {
    Linux,
    Mcu,
    CmsisNn { use_dsp: bool },
}

/// Computes the scratchpad bytes a node needs on a concrete target.
///
/// Passed to the planner explicitly; there is no global helper registry.
pub trait ScratchpadHelper {
    fn scratchpad_size(&self, graph: &Graph, node: NodeId) -> usize;
}

// Bytes of packed input planes for an LQ fully-connected node, zero for
// everything else.
fn lq_packing_bytes(graph: &Graph, node: NodeId) -> usize {
    let node = graph.node(node);
    let Op::LqFullyConnected {
        weights_hidden_size,
        ..
    } = &node.op
    else {
        return 0;
    };

    // Input scales carry the input bit width; a malformed node (caught
    // later by kernel configure) plans as zero.
    let bits = node
        .inputs
        .get(1)
        .and_then(|id| graph.const_tensor(*id))
        .map(|t| t.num_elements())
        .unwrap_or(0);

    bits * ceil_div(*weights_hidden_size, 32) * 4
}

/// Hosted target: kernel scratch is heap-allocated, nothing to plan.
pub struct ScratchpadHelperLinux;

impl ScratchpadHelper for ScratchpadHelperLinux {
    fn scratchpad_size(&self, _graph: &Graph, _node: NodeId) -> usize {
        0
    }
}

/// Bare-metal target: the packing buffer comes out of the arena.
pub struct ScratchpadHelperMcu;

impl ScratchpadHelper for ScratchpadHelperMcu {
    fn scratchpad_size(&self, graph: &Graph, node: NodeId) -> usize {
        lq_packing_bytes(graph, node)
    }
}

/// CMSIS-NN target: as MCU, with a second staging copy when the DSP
/// extension is in use.
pub struct ScratchpadHelperCmsisNn {
    use_dsp: bool,
}

impl ScratchpadHelperCmsisNn {
    pub fn new(use_dsp: bool) -> Self {
        Self { use_dsp }
    }
}

impl ScratchpadHelper for ScratchpadHelperCmsisNn {
    fn scratchpad_size(&self, graph: &Graph, node: NodeId) -> usize {
        let base = lq_packing_bytes(graph, node);
        if self.use_dsp {
            2 * base
        } else {
            base
        }
    }
}

/// The helper for a target platform.
pub fn scratchpad_helper_for(platform: TargetPlatform) -> Box<dyn ScratchpadHelper> {
    match platform {
        TargetPlatform::Linux => Box::new(ScratchpadHelperLinux),
        TargetPlatform::Mcu => Box::new(ScratchpadHelperMcu),
        TargetPlatform::CmsisNn { use_dsp } => Box::new(ScratchpadHelperCmsisNn::new(use_dsp)),
    }
}

///////////
// Tests //
///////////
