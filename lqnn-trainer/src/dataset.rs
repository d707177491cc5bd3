/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The calibration dataset container.
//!
//! A dataset is a sequence of records; each record holds one tensor per
//! graph input. Tensors are either *typed* (dtype + shape + payload, checked
//! against the model's declared inputs when read) or *raw* (bytes only,
//! trusted as-is). The whole file is one mode or the other.
//!
//! On disk the container is a magic-tagged, versioned bincode payload like
//! the model container.

use std::fs;
use std::path::Path;

use lqnn::{DataType, LqError, LqResult, Shape};
use serde::{Deserialize, Serialize};

const MAGIC: [u8; 4] = *b"LQDS";
const VERSION: u32 = 1;

/// One per-input tensor inside a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordTensor {
    Typed {
        dtype: DataType,
        shape: Shape,
        bytes: Vec<u8>,
    },
    Raw {
        bytes: Vec<u8>,
    },
}

impl RecordTensor {
    /// A typed F32 tensor from float values.
    pub fn typed_f32(shape: impl Into<Shape>, values: &[f32]) -> Self {
        RecordTensor::Typed {
            dtype: DataType::F32,
            shape: shape.into(),
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// A raw tensor from float values.
    pub fn raw_f32(values: &[f32]) -> Self {
        RecordTensor::Raw {
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn is_raw(&self) -> bool {
        matches!(self, RecordTensor::Raw { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DatasetPayload {
    records: Vec<Vec<RecordTensor>>,
}

/// Builds a dataset file record by record.
#[derive(Debug, Default)]
pub struct DatasetWriter {
    payload: DatasetPayload,
}

impl DatasetWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, inputs: Vec<RecordTensor>) {
        self.payload.records.push(inputs);
    }

    pub fn save(&self, path: impl AsRef<Path>) -> LqResult<()> {
        let path = path.as_ref();
        let body = bincode::serialize(&self.payload)
            .map_err(|e| LqError::DataCorrupt(format!("unencodable dataset: {e}")))?;
        let mut bytes = Vec::with_capacity(8 + body.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        fs::write(path, bytes).map_err(|e| LqError::io(path.display().to_string(), e))
    }
}

/// Random access over a dataset file.
#[derive(Debug)]
pub struct DatasetReader {
    payload: DatasetPayload,
}

impl DatasetReader {
    /// Open and decode a dataset file.
    pub fn open(path: impl AsRef<Path>) -> LqResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| LqError::io(path.display().to_string(), e))?;

        if bytes.len() < 8 || bytes[..4] != MAGIC {
            return Err(LqError::DataCorrupt(format!(
                "\"{}\" is not a dataset container",
                path.display()
            )));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(LqError::DataCorrupt(format!(
                "unsupported dataset version {version}, expected {VERSION}"
            )));
        }
        let payload: DatasetPayload = bincode::deserialize(&bytes[8..])
            .map_err(|e| LqError::DataCorrupt(format!("undecodable dataset: {e}")))?;

        Ok(Self { payload })
    }

    pub fn num_records(&self) -> usize {
        self.payload.records.len()
    }

    /// Number of inputs in record `record`.
    pub fn num_inputs(&self, record: usize) -> usize {
        self.payload
            .records
            .get(record)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Whether the file stores raw (unchecked) tensors.
    pub fn is_raw_data(&self) -> bool {
        self.payload
            .records
            .first()
            .and_then(|record| record.first())
            .map(RecordTensor::is_raw)
            .unwrap_or(false)
    }

    fn tensor(&self, record: usize, input: usize) -> LqResult<&RecordTensor> {
        self.payload
            .records
            .get(record)
            .and_then(|r| r.get(input))
            .ok_or_else(|| {
                LqError::DataCorrupt(format!("record {record} has no input {input}"))
            })
    }

    /// Read a typed tensor as floats, returning its declared dtype and
    /// shape. Fails on raw records and non-F32 payloads.
    pub fn read_tensor(&self, record: usize, input: usize) -> LqResult<(Shape, Vec<f32>)> {
        match self.tensor(record, input)? {
            RecordTensor::Typed {
                dtype,
                shape,
                bytes,
            } => {
                if *dtype != DataType::F32 {
                    return Err(LqError::DataCorrupt(format!(
                        "record {record} input {input} is {dtype}, expected f32"
                    )));
                }
                if bytes.len() != shape.num_elements() * 4 {
                    return Err(LqError::DataCorrupt(format!(
                        "record {record} input {input} has {} bytes but shape {:?} needs {}",
                        bytes.len(),
                        shape.dims(),
                        shape.num_elements() * 4
                    )));
                }
                Ok((shape.clone(), decode_f32(bytes)))
            }
            RecordTensor::Raw { .. } => Err(LqError::DataCorrupt(format!(
                "record {record} input {input} is raw, expected typed"
            ))),
        }
    }

    /// Read a raw tensor as floats; the caller vouches for the layout.
    pub fn read_tensor_raw(&self, record: usize, input: usize) -> LqResult<Vec<f32>> {
        match self.tensor(record, input)? {
            RecordTensor::Raw { bytes } => {
                if bytes.len() % 4 != 0 {
                    return Err(LqError::DataCorrupt(format!(
                        "record {record} input {input} has {} bytes, not a multiple of 4",
                        bytes.len()
                    )));
                }
                Ok(decode_f32(bytes))
            }
            RecordTensor::Typed { .. } => Err(LqError::DataCorrupt(format!(
                "record {record} input {input} is typed, expected raw"
            ))),
        }
    }
}

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

///////////
// Tests //
///////////
