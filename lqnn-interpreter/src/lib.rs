/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Kernels and single-threaded graph execution.
//!
//! Execution happens in two phases, mirroring how the kernels separate
//! validation from work:
//!
//! 1. **Configure** ([`Interpreter::new`]): every reachable node is checked
//!    against its operand shapes and dtypes, output shapes are inferred, and
//!    per-kernel scratch (the LQ input codec) is allocated. All invariant
//!    violations surface here.
//! 2. **Execute** ([`Interpreter::run`]): kernels run in a stable postorder;
//!    after each output tensor is written the attached [`Observer`] is
//!    notified. The only runtime failure left is an unsupported fused
//!    activation.

pub mod interpreter;
pub mod kernels;
pub mod observer;

pub use interpreter::{Interpreter, NullObserver, Observer};
pub use observer::InputSavingObserver;
