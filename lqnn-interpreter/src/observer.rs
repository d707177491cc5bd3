/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::collections::HashMap;

use lqnn::DataType;
use lqnn_graph::{NodeId, Tensor};

use crate::interpreter::Observer;

/// Captures the tensors flowing into fully-connected nodes during a run.
///
/// The map passed at construction takes each *input-producing* node (the
/// node whose output feeds an FC input) to the FC node consuming it. When
/// the interpreter announces a write to a mapped node, the tensor's
/// elements are appended to a growable buffer keyed by the consumer, so the
/// capture accumulates across records and batches.
///
/// The observer never clears its buffers on its own; the training driver
/// decides when a batch's worth of capture has been consumed.
pub struct InputSavingObserver {
    input_to_consumer: HashMap<NodeId, NodeId>,
    captured: HashMap<NodeId, Vec<f32>>,
}

impl InputSavingObserver {
    /// Construct an observer for the given input-node-to-consumer map.
    ///
    /// Buffers are pre-created (empty) for every consumer, so
    /// [`InputSavingObserver::captured`] is total over the map's values even
    /// before the first run.
    pub fn new(input_to_consumer: HashMap<NodeId, NodeId>) -> Self {
        let captured = input_to_consumer
            .values()
            .map(|consumer| (*consumer, Vec::new()))
            .collect();
        Self {
            input_to_consumer,
            captured,
        }
    }

    /// Everything captured so far for `consumer`.
    ///
    /// # Panics
    ///
    /// Panics if `consumer` is not a value of the construction map.
    pub fn captured(&self, consumer: NodeId) -> &[f32] {
        self.captured
            .get(&consumer)
            .map(Vec::as_slice)
            .unwrap_or_else(|| panic!("node {consumer} is not an observed consumer"))
    }

    /// Drop all captured data, keeping the buffers.
    pub fn clear(&mut self) {
        for buffer in self.captured.values_mut() {
            buffer.clear();
        }
    }
}

impl Observer for InputSavingObserver {
    fn post_tensor_write(&mut self, node: NodeId, tensor: &Tensor) {
        let Some(consumer) = self.input_to_consumer.get(&node) else {
            return;
        };

        assert_eq!(
            tensor.dtype(),
            DataType::F32,
            "captured tensors must be f32"
        );

        let data = tensor.as_f32().unwrap_or(&[]);
        if let Some(buffer) = self.captured.get_mut(consumer) {
            buffer.extend_from_slice(data);
        }
    }
}

///////////
// Tests //
///////////
