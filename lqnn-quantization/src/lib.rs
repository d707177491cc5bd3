/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The learned-quantization (LQ) codec and its scale optimizer.
//!
//! # Encoding
//!
//! A length-`N` float vector is encoded as `K` bit-packed sign planes plus
//! `K` real-valued scales. Bit `b` of value `i` selects the sign applied to
//! scale `b`, so each value reconstructs as
//!
//! ```text
//! x̂[i] = Σ_b scales[b] * (2 * bit(b, i) - 1)
//! ```
//!
//! which means the `2^K` reconstructable levels form a lattice determined
//! entirely by the scales. [`codec::LqCodec`] materializes that lattice (and
//! the midpoint thresholds between adjacent levels) once per scale vector and
//! then encodes values with a binary search.
//!
//! # Training
//!
//! [`qem::Qem`] fits the scales to data by block-coordinate descent:
//! re-encode with the current scales, hold the sign planes fixed, take a few
//! L2-regularized gradient steps on the scales, re-sort, repeat.

pub mod codec;
pub mod qem;

pub use codec::{CodecError, LqCodec};
pub use qem::{Qem, QemError};
