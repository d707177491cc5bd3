/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lqnn::{ceil_div, DataType, LqError, LqResult};
use lqnn_graph::{Model, NodeId, Op, Tensor};
use lqnn_interpreter::{InputSavingObserver, Interpreter};
use lqnn_quantization::{qem, Qem};
use rand::Rng;
use tracing::{info, warn};

use crate::datagen::DataGenerator;

// Learning schedule defaults; see `configure_schedule`.
const DEFAULT_TRAIN_BATCHES: usize = 128;
const DEFAULT_QEM_ITERATIONS: usize = 5;
const DEFAULT_TRAIN_EPOCHS: usize = 5;

const DEFAULT_ENCODING_BITS: usize = 2;

/// Post-training LQ quantization of a full-precision model.
///
/// The flow is a straight line:
///
/// 1. [`Quantizer::initialize`]: load the model, clone it twice, and replace
///    every supported fully-connected node in the second clone with an LQ
///    prototype (uninitialized scale/plane constants).
/// 2. [`Quantizer::train`]: fit weight scales from the FP weights, then fit
///    input scales from activations captured on calibration data, then
///    refit the input scales so the LQ-side activation distribution
///    reconstructs the FP-side reference.
/// 3. [`Quantizer::save`]: write the LQ clone out.
///
/// Any failure aborts the whole flow; there is no partial recovery.
pub struct Quantizer {
    fp_model: Option<Model>,
    lq_model: Option<Model>,

    // FP fully-connected node -> its LQ replacement (ids are parallel
    // because both models are clones of the same graph).
    fp2lq: Vec<(NodeId, NodeId)>,

    // Input-producing node -> the FC consuming it, one map per clone.
    input2fp: HashMap<NodeId, NodeId>,
    input2lq: HashMap<NodeId, NodeId>,

    use_random: bool,
    data_path: Option<PathBuf>,

    input_encoding_bits: usize,
    weights_encoding_bits: usize,

    train_batches: usize,
    qem_iterations: usize,
    train_epochs: usize,
}

impl Default for Quantizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Quantizer {
    /// A quantizer with the default bit width for inputs and weights.
    pub fn new() -> Self {
        Self::with_bits(DEFAULT_ENCODING_BITS, DEFAULT_ENCODING_BITS)
    }

    /// A quantizer using `bits` for both inputs and weights.
    pub fn with_encode_bits(bits: usize) -> Self {
        Self::with_bits(bits, bits)
    }

    /// A quantizer with separate input and weight bit widths.
    pub fn with_bits(input_encoding_bits: usize, weights_encoding_bits: usize) -> Self {
        Self {
            fp_model: None,
            lq_model: None,
            fp2lq: Vec::new(),
            input2fp: HashMap::new(),
            input2lq: HashMap::new(),
            use_random: true,
            data_path: None,
            input_encoding_bits,
            weights_encoding_bits,
            train_batches: DEFAULT_TRAIN_BATCHES,
            qem_iterations: DEFAULT_QEM_ITERATIONS,
            train_epochs: DEFAULT_TRAIN_EPOCHS,
        }
    }

    /// Override the training schedule (batch count per capture round, QEM
    /// iterations per fit, and outer epochs).
    pub fn configure_schedule(
        &mut self,
        train_batches: usize,
        qem_iterations: usize,
        train_epochs: usize,
    ) {
        self.train_batches = train_batches;
        self.qem_iterations = qem_iterations;
        self.train_epochs = train_epochs;
    }

    /// Use a calibration dataset instead of randomly generated records.
    pub fn path_to_input_data(&mut self, path: impl Into<PathBuf>) {
        self.data_path = Some(path.into());
        self.use_random = false;
    }

    /// Load the source model and build the bound LQ clone.
    pub fn initialize(&mut self, input_model_path: impl AsRef<Path>) -> LqResult<()> {
        let model = Model::load(input_model_path)?;
        self.initialize_with(model)
    }

    /// As [`Quantizer::initialize`], from an already-loaded model.
    pub fn initialize_with(&mut self, model: Model) -> LqResult<()> {
        self.fp_model = Some(model.clone());
        self.lq_model = Some(model);
        self.make_binded_lqgraph()?;
        Ok(())
    }

    /// Run all three training phases.
    pub fn train(&mut self) -> LqResult<()> {
        info!(pairs = self.fp2lq.len(), "training weight scales");
        self.train_weights()?;
        info!("training input scales");
        self.train_input()?;
        info!("uptraining input scales against the FP reference");
        self.uptrain_input()?;
        Ok(())
    }

    /// Write the LQ model out.
    pub fn save(&self, output_model_path: impl AsRef<Path>) -> LqResult<()> {
        let lq = self
            .lq_model
            .as_ref()
            .ok_or_else(|| not_initialized())?;
        lq.save(output_model_path)
    }

    /// The trained LQ model.
    pub fn lq_model(&self) -> Option<&Model> {
        self.lq_model.as_ref()
    }

    /// FP-to-LQ fully-connected pairings established at initialization.
    pub fn pairs(&self) -> &[(NodeId, NodeId)] {
        &self.fp2lq
    }

    // Replace every supported FC node in the LQ clone with an LQ prototype
    // and record the pairings. Both clones share node ids, so structural
    // matching is by id.
    fn make_binded_lqgraph(&mut self) -> LqResult<()> {
        let fp = self.fp_model.as_ref().ok_or_else(not_initialized)?;
        let lq = self.lq_model.as_mut().ok_or_else(not_initialized)?;

        for id in fp.graph.node_ids().collect::<Vec<_>>() {
            let fp_node = fp.graph.node(id);
            let Op::FullyConnected { activation } = fp_node.op else {
                continue;
            };

            // Only FC with constant rank-2 f32 weights has an LQ analogue;
            // everything else stays full precision in the clone.
            let weights_id = match fp_node.inputs.get(1) {
                Some(id) => *id,
                None => continue,
            };
            let Some(weights) = fp.graph.const_tensor(weights_id) else {
                warn!(node = %fp_node.name, "skipping FC with non-constant weights");
                continue;
            };
            if weights.dtype() != DataType::F32 || weights.shape().rank() != 2 {
                warn!(node = %fp_node.name, "skipping FC with unsupported weights");
                continue;
            }

            let output_size = weights.shape().dim(0);
            let hidden_size = weights.shape().dim(1);
            let name = fp_node.name.clone();
            let input_producer = fp_node.inputs[0];
            let bias = fp_node.inputs.get(2).copied();

            // Uninitialized LQ constants; training fills them in.
            let input_scales = lq.graph.add_node(
                format!("{name}/input_scales"),
                Op::Const(Tensor::zeros(
                    DataType::F32,
                    [self.input_encoding_bits],
                )),
                vec![],
            );
            let weights_scales = lq.graph.add_node(
                format!("{name}/weights_scales"),
                Op::Const(Tensor::zeros(
                    DataType::F32,
                    [output_size, self.weights_encoding_bits],
                )),
                vec![],
            );
            let weights_binary = lq.graph.add_node(
                format!("{name}/weights_binary"),
                Op::Const(Tensor::zeros(
                    DataType::S32,
                    [
                        output_size,
                        self.weights_encoding_bits,
                        ceil_div(hidden_size, 32),
                    ],
                )),
                vec![],
            );

            let mut inputs = vec![input_producer, input_scales, weights_scales, weights_binary];
            if let Some(bias) = bias {
                inputs.push(bias);
            }

            let lq_node = lq.graph.node_mut(id);
            lq_node.name = format!("{name}/LQFullyConnected");
            lq_node.op = Op::LqFullyConnected {
                weights_hidden_size: hidden_size,
                activation,
            };
            lq_node.inputs = inputs;

            self.fp2lq.push((id, id));
            self.input2fp.insert(input_producer, id);
            self.input2lq.insert(input_producer, id);
        }

        info!(pairs = self.fp2lq.len(), "built bound LQ graph");
        Ok(())
    }

    // Fit per-neuron weight scales to the FP weights and pack the sign
    // planes. Scales start from U(0, 1) noise.
    fn train_weights(&mut self) -> LqResult<()> {
        let fp = self.fp_model.as_ref().ok_or_else(not_initialized)?;
        let lq = self.lq_model.as_mut().ok_or_else(not_initialized)?;

        let bits = self.weights_encoding_bits;
        let mut rng = rand::rng();

        for &(fp_id, lq_id) in &self.fp2lq {
            let weights_id = fp.graph.node(fp_id).inputs[1];
            let weights = fp
                .graph
                .const_tensor(weights_id)
                .and_then(Tensor::as_f32)
                .ok_or_else(|| {
                    LqError::InvariantViolation(format!(
                        "paired FC {fp_id} lost its constant weights"
                    ))
                })?;
            let shape = fp.graph.const_tensor(weights_id).map(Tensor::shape);
            let (output_size, hidden_size) = match shape {
                Some(shape) => (shape.dim(0), shape.dim(1)),
                None => continue,
            };

            let mut scales: Vec<f32> = (0..output_size * bits).map(|_| rng.random()).collect();

            let mut coach = Qem::new(weights, weights, &mut scales, output_size, hidden_size, bits)
                .map_err(|e| LqError::InvariantViolation(e.to_string()))?;
            coach.fit(self.qem_iterations * self.train_epochs);

            let mut binary = vec![0i32; qem::binary_len(output_size, hidden_size, bits)];
            coach.fill_binary(&mut binary);

            let lq_node_inputs = lq.graph.node(lq_id).inputs.clone();
            write_f32_const(lq, lq_node_inputs[2], &scales)?;
            write_s32_const(lq, lq_node_inputs[3], &binary)?;
        }

        Ok(())
    }

    // Fit input scales so the LQ encoding reconstructs the FP activations
    // feeding each FC. Data flows through the FP interpreter only.
    fn train_input(&mut self) -> LqResult<()> {
        let mut generator = self.build_generator()?;

        for _ in 0..self.train_epochs {
            generator.reset();

            while !generator.is_empty() {
                let observer = {
                    let fp = self.fp_model.as_ref().ok_or_else(not_initialized)?;
                    let mut interpreter = Interpreter::new(&fp.graph)?;
                    let mut observer = InputSavingObserver::new(self.input2fp.clone());

                    for _ in 0..self.train_batches {
                        if generator.is_empty() {
                            break;
                        }
                        feed_record(&mut generator, &mut interpreter)?;
                        interpreter.run(&mut observer)?;
                    }
                    observer
                };

                for pair_idx in 0..self.fp2lq.len() {
                    let (fp_id, lq_id) = self.fp2lq[pair_idx];
                    let captured = observer.captured(fp_id);
                    if captured.is_empty() {
                        continue;
                    }
                    self.fit_input_scales(lq_id, captured, captured)?;
                }
            }
        }

        Ok(())
    }

    // Refit input scales with the LQ-side activations as the encoding
    // source and the FP-side activations as the reconstruction target.
    // Both interpreters see identical inputs.
    fn uptrain_input(&mut self) -> LqResult<()> {
        let mut generator = self.build_generator()?;

        for _ in 0..self.train_epochs {
            generator.reset();

            while !generator.is_empty() {
                let (fp_observer, lq_observer) = {
                    let fp = self.fp_model.as_ref().ok_or_else(not_initialized)?;
                    let lq = self.lq_model.as_ref().ok_or_else(not_initialized)?;

                    let mut fp_interpreter = Interpreter::new(&fp.graph)?;
                    let mut lq_interpreter = Interpreter::new(&lq.graph)?;
                    let mut fp_observer = InputSavingObserver::new(self.input2fp.clone());
                    let mut lq_observer = InputSavingObserver::new(self.input2lq.clone());

                    for _ in 0..self.train_batches {
                        if generator.is_empty() {
                            break;
                        }
                        feed_record_pair(&mut generator, &mut fp_interpreter, &mut lq_interpreter)?;
                        fp_interpreter.run(&mut fp_observer)?;
                        lq_interpreter.run(&mut lq_observer)?;
                    }
                    (fp_observer, lq_observer)
                };

                for pair_idx in 0..self.fp2lq.len() {
                    let (fp_id, lq_id) = self.fp2lq[pair_idx];
                    let fp_captured = fp_observer.captured(fp_id);
                    let lq_captured = lq_observer.captured(lq_id);
                    if fp_captured.is_empty() {
                        continue;
                    }
                    if fp_captured.len() != lq_captured.len() {
                        return Err(LqError::InvariantViolation(format!(
                            "captured {} LQ values but {} FP values for pair {}/{}",
                            lq_captured.len(),
                            fp_captured.len(),
                            lq_id,
                            fp_id
                        )));
                    }
                    self.fit_input_scales(lq_id, lq_captured, fp_captured)?;
                }
            }
        }

        Ok(())
    }

    // One QEM fit of an LQ node's input scales over a captured activation
    // buffer, in place.
    fn fit_input_scales(&mut self, lq_id: NodeId, source: &[f32], target: &[f32]) -> LqResult<()> {
        let bits = self.input_encoding_bits;
        let iterations = self.qem_iterations;
        let lq = self.lq_model.as_mut().ok_or_else(not_initialized)?;

        let scales_id = lq.graph.node(lq_id).inputs[1];
        let mut scales = lq
            .graph
            .const_tensor(scales_id)
            .and_then(Tensor::as_f32)
            .ok_or_else(|| {
                LqError::InvariantViolation(format!("LQ FC {lq_id} lost its input_scales"))
            })?
            .to_vec();

        let mut coach = Qem::new(source, target, &mut scales, 1, source.len(), bits)
            .map_err(|e| LqError::InvariantViolation(e.to_string()))?;
        coach.fit(iterations);

        write_f32_const(lq, scales_id, &scales)
    }

    fn build_generator(&self) -> LqResult<DataGenerator> {
        let fp = self.fp_model.as_ref().ok_or_else(not_initialized)?;
        let inputs_count = fp.graph.inputs().len();
        if inputs_count == 0 {
            return Err(LqError::InvariantViolation(
                "model declares no inputs".to_string(),
            ));
        }

        if self.use_random {
            let mut generator = DataGenerator::random(inputs_count, usize::MAX);
            generator.set_required_records(self.train_batches * 3);
            Ok(generator)
        } else {
            let path = self.data_path.as_ref().ok_or_else(not_initialized)?;
            let generator = DataGenerator::from_file(path)?;
            if generator.inputs_count() != inputs_count {
                return Err(LqError::DataCorrupt(format!(
                    "dataset records carry {} inputs but the model declares {}",
                    generator.inputs_count(),
                    inputs_count
                )));
            }
            Ok(generator)
        }
    }
}

fn not_initialized() -> LqError {
    LqError::InvariantViolation("quantizer is not initialized".to_string())
}

// Read one record from the generator into the interpreter's inputs.
fn feed_record(generator: &mut DataGenerator, interpreter: &mut Interpreter<'_>) -> LqResult<()> {
    let graph = interpreter.graph();
    for &input_id in graph.inputs() {
        let Op::Input { shape, .. } = &graph.node(input_id).op else {
            continue;
        };
        let mut buffer = vec![0.0f32; shape.num_elements()];
        if !generator.read_record(&mut buffer)? {
            return Err(LqError::DataCorrupt(
                "input data ended in the middle of a record".to_string(),
            ));
        }
        interpreter.write_input(input_id, &buffer)?;
    }
    Ok(())
}

// Read one record and feed the identical data to both interpreters.
fn feed_record_pair(
    generator: &mut DataGenerator,
    fp_interpreter: &mut Interpreter<'_>,
    lq_interpreter: &mut Interpreter<'_>,
) -> LqResult<()> {
    let fp_graph = fp_interpreter.graph();
    let lq_inputs = lq_interpreter.graph().inputs().to_vec();

    for (index, &input_id) in fp_graph.inputs().iter().enumerate() {
        let Op::Input { shape, .. } = &fp_graph.node(input_id).op else {
            continue;
        };
        let mut buffer = vec![0.0f32; shape.num_elements()];
        if !generator.read_record(&mut buffer)? {
            return Err(LqError::DataCorrupt(
                "input data ended in the middle of a record".to_string(),
            ));
        }
        fp_interpreter.write_input(input_id, &buffer)?;
        lq_interpreter.write_input(lq_inputs[index], &buffer)?;
    }
    Ok(())
}

fn write_f32_const(model: &mut Model, id: NodeId, values: &[f32]) -> LqResult<()> {
    let data = model
        .graph
        .const_tensor_mut(id)
        .and_then(Tensor::as_f32_mut)
        .ok_or_else(|| {
            LqError::InvariantViolation(format!("node {id} is not an f32 constant"))
        })?;
    if data.len() != values.len() {
        return Err(LqError::InvariantViolation(format!(
            "constant {id} holds {} values, tried to write {}",
            data.len(),
            values.len()
        )));
    }
    data.copy_from_slice(values);
    Ok(())
}

fn write_s32_const(model: &mut Model, id: NodeId, values: &[i32]) -> LqResult<()> {
    let data = model
        .graph
        .const_tensor_mut(id)
        .and_then(Tensor::as_s32_mut)
        .ok_or_else(|| {
            LqError::InvariantViolation(format!("node {id} is not an s32 constant"))
        })?;
    if data.len() != values.len() {
        return Err(LqError::InvariantViolation(format!(
            "constant {id} holds {} values, tried to write {}",
            data.len(),
            values.len()
        )));
    }
    data.copy_from_slice(values);
    Ok(())
}

///////////
// Tests //
///////////
