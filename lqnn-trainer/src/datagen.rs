/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::path::Path;

use lqnn::{LqError, LqResult};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::dataset::DatasetReader;

/// Fill `data` with uniform samples from `[0, 1)`.
pub fn set_float_random_data(rng: &mut StdRng, data: &mut [f32]) {
    for value in data.iter_mut() {
        *value = rng.random::<f32>();
    }
}

#[derive(Debug)]
enum Source {
    Random(StdRng),
    File(DatasetReader),
}

/// A lazy, finite sequence of input records for the training drivers.
///
/// Each record is one tensor per graph input, read input-by-input in order.
/// Exhaustion is a normal control value (`Ok(false)` from
/// [`DataGenerator::read_record`]), not an error.
///
/// The random source samples `U(0, 1)` per element and caps the record
/// count; it stands in for calibration data when none is provided, at the
/// cost of accuracy.
#[derive(Debug)]
pub struct DataGenerator {
    source: Source,
    inputs_num: usize,
    records_num: usize,
    input_idx: usize,
    record_idx: usize,
}

impl DataGenerator {
    /// A random generator producing `records_num` records of `inputs_num`
    /// tensors each, seeded from the platform RNG.
    pub fn random(inputs_num: usize, records_num: usize) -> Self {
        Self::random_seeded(inputs_num, records_num, rand::rng().random())
    }

    /// A random generator with a fixed seed.
    pub fn random_seeded(inputs_num: usize, records_num: usize, seed: u64) -> Self {
        Self {
            source: Source::Random(StdRng::seed_from_u64(seed)),
            inputs_num,
            records_num,
            input_idx: 0,
            record_idx: 0,
        }
    }

    /// A generator backed by a dataset file.
    ///
    /// Fails if the file cannot be opened or contains no records.
    pub fn from_file(path: impl AsRef<Path>) -> LqResult<Self> {
        let reader = DatasetReader::open(path)?;
        let records_num = reader.num_records();
        if records_num == 0 {
            return Err(LqError::DataCorrupt(
                "dataset contains no records".to_string(),
            ));
        }
        let inputs_num = reader.num_inputs(0);

        Ok(Self {
            source: Source::File(reader),
            inputs_num,
            records_num,
            input_idx: 0,
            record_idx: 0,
        })
    }

    /// Lower the record cap; a request above the current count is ignored.
    pub fn set_required_records(&mut self, records_num: usize) {
        self.records_num = self.records_num.min(records_num);
    }

    /// Number of inputs per record.
    pub fn inputs_count(&self) -> usize {
        self.inputs_num
    }

    pub fn current_input_idx(&self) -> usize {
        self.input_idx
    }

    pub fn current_record_idx(&self) -> usize {
        self.record_idx
    }

    /// Whether every record has been read.
    pub fn is_empty(&self) -> bool {
        self.record_idx >= self.records_num
    }

    /// Rewind to the first record.
    pub fn reset(&mut self) {
        self.input_idx = 0;
        self.record_idx = 0;
    }

    /// Fill `data` with the next input tensor.
    ///
    /// Returns `Ok(false)` once the generator is exhausted. File-backed
    /// typed records are checked against the expected element count; a
    /// mismatch is `DataCorrupt`.
    pub fn read_record(&mut self, data: &mut [f32]) -> LqResult<bool> {
        if self.is_empty() {
            return Ok(false);
        }

        match &mut self.source {
            Source::Random(rng) => set_float_random_data(rng, data),
            Source::File(reader) => {
                if reader.is_raw_data() {
                    let values = reader.read_tensor_raw(self.record_idx, self.input_idx)?;
                    if values.len() != data.len() {
                        return Err(LqError::DataCorrupt(format!(
                            "record {} input {} has {} values, expected {}",
                            self.record_idx,
                            self.input_idx,
                            values.len(),
                            data.len()
                        )));
                    }
                    data.copy_from_slice(&values);
                } else {
                    let (shape, values) = reader.read_tensor(self.record_idx, self.input_idx)?;
                    if shape.num_elements() != data.len() {
                        return Err(LqError::DataCorrupt(format!(
                            "record {} input {} has shape {:?}, expected {} elements",
                            self.record_idx,
                            self.input_idx,
                            shape.dims(),
                            data.len()
                        )));
                    }
                    data.copy_from_slice(&values);
                }
            }
        }

        self.input_idx += 1;
        if self.input_idx >= self.inputs_num {
            self.input_idx = 0;
            self.record_idx += 1;
        }

        Ok(true)
    }
}

///////////
// Tests //
///////////
