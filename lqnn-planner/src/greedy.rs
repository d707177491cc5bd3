/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The greedy-by-size interval allocator.
//!
//! The approach follows the "greedy by size" algorithm from the paper
//! "Efficient Memory Management for Deep Neural Net Inference": place the
//! largest allocations first, each at the smallest offset that does not
//! collide with an already-placed allocation alive over the same ticks.

/// One allocation to place: an id, a byte size, and the live interval in
/// execution-order ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub node: usize,
    pub size: usize,
    pub first_use: usize,
    pub last_use: usize,
}

impl AllocationRequest {
    // Two requests conflict when their intervals overlap by more than a
    // shared endpoint; the hand-off tick between a producer and its last
    // consumer may share bytes.
    fn conflicts(&self, other: &AllocationRequest) -> bool {
        self.first_use < other.last_use && other.first_use < self.last_use
    }

    // Whether this request's tensor occupies memory at tick `t`.
    fn alive_at(&self, t: usize) -> bool {
        self.first_use <= t && t < self.last_use.max(self.first_use + 1)
    }
}

/// The result of [`greedy_by_size`]: per-request offsets (parallel to the
/// input slice) and the arena size they require.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreedyPlan {
    pub offsets: Vec<usize>,
    pub breadths: Vec<usize>,
    pub required_size: usize,
}

/// Assign arena offsets to `requests`.
///
/// Candidates are walked largest-size first (ties broken by larger breadth,
/// then by id, so the order is deterministic); each is placed at the
/// leftmost offset whose byte range avoids every already-placed conflicting
/// request.
pub fn greedy_by_size(requests: &[AllocationRequest]) -> GreedyPlan {
    // Breadth: the memory pressure at the moment a request first needs its
    // allocation. Used only as a tie-breaker.
    let breadths: Vec<usize> = requests
        .iter()
        .map(|r| {
            requests
                .iter()
                .filter(|other| other.alive_at(r.first_use))
                .map(|other| other.size)
                .sum()
        })
        .collect();

    let mut candidate_order: Vec<usize> = (0..requests.len()).collect();
    candidate_order.sort_by_key(|&i| {
        (
            std::cmp::Reverse(requests[i].size),
            std::cmp::Reverse(breadths[i]),
            requests[i].node,
        )
    });

    let mut offsets = vec![0usize; requests.len()];
    let mut placed: Vec<usize> = Vec::with_capacity(requests.len());
    let mut required_size = 0usize;

    for &candidate in &candidate_order {
        let request = &requests[candidate];

        // Already-placed requests alive at the same time, in offset order.
        let mut neighbors: Vec<usize> = placed
            .iter()
            .copied()
            .filter(|&p| requests[p].conflicts(request))
            .collect();
        neighbors.sort_by_key(|&p| offsets[p]);

        // Scan for the leftmost gap that fits.
        let mut offset = 0usize;
        for &neighbor in &neighbors {
            if offset + request.size <= offsets[neighbor] {
                break;
            }
            offset = offset.max(offsets[neighbor] + requests[neighbor].size);
        }

        offsets[candidate] = offset;
        required_size = required_size.max(offset + request.size);
        placed.push(candidate);
    }

    GreedyPlan {
        offsets,
        breadths,
        required_size,
    }
}

///////////
// Tests //
///////////
