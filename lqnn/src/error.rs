/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The common error type for the toolchain.

use std::io;

use thiserror::Error;

use crate::activation::UnsupportedActivation;

/// Convenience alias for a `Result<T, LqError>`.
pub type LqResult<T> = Result<T, LqError>;

/// Discriminant for the runtime origin of an [`LqError`].
///
/// Driver code matches on the kind to pick an exit path; the error itself
/// carries the human-readable details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LqErrorKind {
    /// A model or dataset file could not be opened or read.
    IoFailure,
    /// The model container failed verification.
    ModelVerifyFailure,
    /// A shape, dtype, or bit-width bound was violated.
    InvariantViolation,
    /// An operator has no evaluator or no LQ analogue.
    UnsupportedOperator,
    /// A fused activation has no evaluator.
    UnsupportedActivation,
    /// A dataset record disagrees with the model's declared inputs.
    DataCorrupt,
}

/// Common error type shared through the toolchain.
///
/// All failures in the training and recording drivers are fatal: they
/// propagate to the binary entry point, print as a single-line chain, and
/// exit nonzero. Nothing in this workspace retries.
#[derive(Debug, Error)]
pub enum LqError {
    #[error("cannot access \"{path}\"")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("model verification failed: {0}")]
    ModelVerify(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("unsupported operator \"{0}\"")]
    UnsupportedOperator(String),

    #[error(transparent)]
    UnsupportedActivation(#[from] UnsupportedActivation),

    #[error("corrupt input data: {0}")]
    DataCorrupt(String),
}

impl LqError {
    /// Construct an [`LqError::Io`] recording the offending path.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        LqError::Io {
            path: path.into(),
            source,
        }
    }

    /// Return the kind discriminant for this error.
    pub fn kind(&self) -> LqErrorKind {
        match self {
            LqError::Io { .. } => LqErrorKind::IoFailure,
            LqError::ModelVerify(_) => LqErrorKind::ModelVerifyFailure,
            LqError::InvariantViolation(_) => LqErrorKind::InvariantViolation,
            LqError::UnsupportedOperator(_) => LqErrorKind::UnsupportedOperator,
            LqError::UnsupportedActivation(_) => LqErrorKind::UnsupportedActivation,
            LqError::DataCorrupt(_) => LqErrorKind::DataCorrupt,
        }
    }
}

/// Format the entire error chain for `err` by first calling `err.to_string()`
/// and then walking the error's source tree.
pub fn format_chain<E>(err: &E) -> String
where
    E: std::error::Error + ?Sized,
{
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(current) = source {
        message.push_str(": ");
        message.push_str(&current.to_string());
        source = current.source();
    }
    message
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Activation;

    #[test]
    fn kinds_match_variants() {
        let err = LqError::io("model.lqnn", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.kind(), LqErrorKind::IoFailure);

        let err = LqError::ModelVerify("bad magic".to_string());
        assert_eq!(err.kind(), LqErrorKind::ModelVerifyFailure);

        let err = LqError::from(UnsupportedActivation(Activation::SignBit));
        assert_eq!(err.kind(), LqErrorKind::UnsupportedActivation);
    }

    #[test]
    fn chain_formatting() {
        let err = LqError::io("data.bin", io::Error::from(io::ErrorKind::PermissionDenied));
        let message = format_chain(&err);
        assert!(message.starts_with("cannot access \"data.bin\": "), "{message}");
    }
}
