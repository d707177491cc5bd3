/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Tensor arena planning for graph execution.
//!
//! Given an execution order and the live interval of every node's output,
//! the planner assigns byte offsets in a single arena using the
//! greedy-by-size heuristic (largest tensors first, each at the leftmost
//! offset that fits among already-placed neighbors that are alive at the
//! same time).
//!
//! Interval convention: a tensor produced at tick `t` with its last consumer
//! at tick `u` carries the interval `[t, u]`, and two intervals conflict
//! only when they overlap by more than a shared endpoint. The shared
//! endpoint is the hand-off tick, where a consumer's output may legally
//! reuse its operand's bytes.

pub mod greedy;
pub mod planner;
pub mod scratchpad;

pub use greedy::{greedy_by_size, AllocationRequest, GreedyPlan};
pub use planner::{AllocationKind, ExecutionPlan, ExecutionPlanner, PlannedAllocation, PlanningMode};
pub use scratchpad::{scratchpad_helper_for, ScratchpadHelper, TargetPlatform};
