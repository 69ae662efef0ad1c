//! Warp emulation: a fixed group of lanes reducing through register
//! exchange.
//!
//! A warp reduction never touches shared memory. Each step every lane reads
//! the register of the lane whose id differs in one bit (`lane ^ offset`)
//! and combines it with its own; after log2(32) steps every lane holds the
//! full reduction. Kernels keep per-lane partial results in a [`Warp`] and
//! call [`Warp::all_reduce`], mirroring a `__shfl_xor_sync` butterfly.

/// Lanes per warp.
pub const WARP_SIZE: usize = 32;

/// One register per lane.
#[derive(Debug, Clone, Copy)]
pub struct Warp<A> {
    lanes: [A; WARP_SIZE],
}

impl<A: Copy> Warp<A> {
    /// Every lane starts with `init` (the identity of the coming reduction).
    pub fn splat(init: A) -> Self {
        Warp {
            lanes: [init; WARP_SIZE],
        }
    }

    pub fn lane(&self, id: usize) -> A {
        self.lanes[id]
    }

    pub fn set(&mut self, id: usize, v: A) {
        self.lanes[id] = v;
    }

    /// Combine `v` into lane `id`'s register.
    pub fn update(&mut self, id: usize, v: A, op: impl Fn(A, A) -> A) {
        self.lanes[id] = op(self.lanes[id], v);
    }

    /// Value lane `id` would read from `shfl_xor(offset)`.
    pub fn shfl_xor(&self, id: usize, offset: usize) -> A {
        self.lanes[id ^ offset]
    }

    /// Butterfly all-reduce; every lane ends up holding the result, which is
    /// returned from lane 0.
    pub fn all_reduce(&mut self, op: impl Fn(A, A) -> A) -> A {
        let mut offset = WARP_SIZE / 2;
        while offset > 0 {
            let snapshot = self.lanes;
            for (id, lane) in self.lanes.iter_mut().enumerate() {
                *lane = op(*lane, snapshot[id ^ offset]);
            }
            offset /= 2;
        }
        self.lanes[0]
    }
}

/// Elements each lane handles for a row budget of `budget` columns.
pub fn elems_per_lane(budget: usize) -> usize {
    budget.div_ceil(WARP_SIZE).max(1)
}
