/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The on-disk model container.
//!
//! The container is a magic-tagged, versioned bincode payload:
//!
//! - 4-byte magic `b"LQNN"`
//! - format version (u32 LE)
//! - bincode-encoded [`Model`]
//!
//! Verification failures (bad magic, unknown version, undecodable payload)
//! are distinct from I/O failures so drivers can report them separately.

use std::fs;
use std::path::Path;

use lqnn::{LqError, LqResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::Graph;

const MAGIC: [u8; 4] = *b"LQNN";
const VERSION: u32 = 1;

/// A model: one operator graph plus its inline constants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub graph: Graph,
}

impl Model {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }

    /// Read and verify a model container.
    pub fn load(path: impl AsRef<Path>) -> LqResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| LqError::io(path.display().to_string(), e))?;
        let model = Self::from_bytes(&bytes)?;
        debug!(
            path = %path.display(),
            nodes = model.graph.len(),
            "loaded model"
        );
        Ok(model)
    }

    /// Decode a model container from memory.
    pub fn from_bytes(bytes: &[u8]) -> LqResult<Self> {
        if bytes.len() < 8 || bytes[..4] != MAGIC {
            return Err(LqError::ModelVerify("bad magic".to_string()));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(LqError::ModelVerify(format!(
                "unsupported container version {version}, expected {VERSION}"
            )));
        }
        let model: Model = bincode::deserialize(&bytes[8..])
            .map_err(|e| LqError::ModelVerify(format!("undecodable payload: {e}")))?;

        // A verified container must still be a well-formed graph.
        model.graph.execution_order()?;
        Ok(model)
    }

    /// Serialize to the container format.
    pub fn to_bytes(&self) -> LqResult<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| LqError::ModelVerify(format!("unencodable model: {e}")))?;
        let mut bytes = Vec::with_capacity(8 + payload.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Write the model container to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> LqResult<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        fs::write(path, bytes).map_err(|e| LqError::io(path.display().to_string(), e))?;
        debug!(path = %path.display(), "saved model");
        Ok(())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use lqnn::{Activation, LqErrorKind};

    use super::*;
    use crate::graph::Op;
    use crate::tensor::Tensor;

    fn small_model() -> Model {
        let mut graph = Graph::new();
        let input = graph.add_node(
            "input",
            Op::Input {
                dtype: lqnn::DataType::F32,
                shape: lqnn::Shape::from([1, 2]),
            },
            vec![],
        );
        let weights = graph.add_node(
            "weights",
            Op::Const(Tensor::f32([3, 2], vec![0.5; 6]).unwrap()),
            vec![],
        );
        let fc = graph.add_node(
            "fc",
            Op::FullyConnected {
                activation: Activation::Relu,
            },
            vec![input, weights],
        );
        graph.add_output(fc);
        Model::new(graph)
    }

    #[test]
    fn container_round_trip() {
        let model = small_model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.lqnn");

        model.save(&path).unwrap();
        let loaded = Model::load(&path).unwrap();
        assert_eq!(model, loaded);
    }

    #[test]
    fn missing_file_is_io_failure() {
        let err = Model::load("/nonexistent/model.lqnn").unwrap_err();
        assert_eq!(err.kind(), LqErrorKind::IoFailure);
    }

    #[test]
    fn bad_magic_fails_verification() {
        let mut bytes = small_model().to_bytes().unwrap();
        bytes[0] = b'X';
        let err = Model::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), LqErrorKind::ModelVerifyFailure);
    }

    #[test]
    fn unknown_version_fails_verification() {
        let mut bytes = small_model().to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        let err = Model::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), LqErrorKind::ModelVerifyFailure);
    }

    #[test]
    fn truncated_payload_fails_verification() {
        let bytes = small_model().to_bytes().unwrap();
        let err = Model::from_bytes(&bytes[..bytes.len() - 4]).unwrap_err();
        assert_eq!(err.kind(), LqErrorKind::ModelVerifyFailure);
    }
}
