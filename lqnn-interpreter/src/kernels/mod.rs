/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

pub mod fully_connected;
pub mod lq_fully_connected;

pub use fully_connected::FullyConnectedKernel;
pub use lq_fully_connected::LqFullyConnectedKernel;

use lqnn::{LqError, LqResult};

// Shared configure-time check helper; failures surface as invariant
// violations to the caller.
pub(crate) fn check(cond: bool, message: impl FnOnce() -> String) -> LqResult<()> {
    if cond {
        Ok(())
    } else {
        Err(LqError::InvariantViolation(message()))
    }
}
