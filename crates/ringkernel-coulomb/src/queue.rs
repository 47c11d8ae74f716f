//! Triangular stripe tiling and the dynamic stripe work queue.
//!
//! The N x N interaction matrix is cut into 32 x 32 tiles addressed by a row
//! stripe `bpos` and a column stripe `tpos` with `0 <= tpos <= bpos`. Groups
//! own whole row stripes: the first one is assigned statically from the group
//! index, every later one is claimed from a shared device-resident counter.

use crate::device::DeviceSlice;
use crate::warp::WARP_SIZE;

/// Number of 32-particle stripes covering `n` particles.
#[inline]
pub fn stripe_count(n: usize) -> usize {
    n.div_ceil(WARP_SIZE)
}

/// Initial counter value for a launch with `total_groups` groups.
///
/// Stripes `nstripes - 1` down to `nstripes - total_groups` are taken
/// statically by the groups themselves, so the counter starts at the next one.
#[inline]
pub fn initial_counter(nstripes: usize, total_groups: u32) -> i32 {
    nstripes as i32 - total_groups as i32 - 1
}

/// Stripe a group processes before touching the counter (negative: no work).
#[inline]
pub fn first_stripe(nstripes: usize, global_group: u32) -> i64 {
    nstripes as i64 - 1 - global_group as i64
}

/// Number of tiles in the lower triangle including the diagonal.
#[inline]
pub fn tile_count(nstripes: usize) -> usize {
    nstripes * (nstripes + 1) / 2
}

/// Dense index of tile `(bpos, tpos)` with `tpos <= bpos`.
#[inline]
pub fn tile_index(bpos: usize, tpos: usize) -> usize {
    debug_assert!(tpos <= bpos);
    bpos * (bpos + 1) / 2 + tpos
}

/// Lock-free queue of unclaimed row stripes.
///
/// Backed by a single 32-bit cell in device memory that counts down; a claim
/// is one atomic decrement and never blocks.
#[derive(Clone, Copy)]
pub struct StripeQueue<'a> {
    counter: &'a DeviceSlice<i32>,
}

impl<'a> StripeQueue<'a> {
    /// Wrap a device-resident counter cell.
    pub fn new(counter: &'a DeviceSlice<i32>) -> Self {
        Self { counter }
    }

    /// Set the next stripe to hand out.
    pub fn reset(&self, next: i32) {
        self.counter.store(0, next);
    }

    /// Claim the next unclaimed stripe, or `None` once exhausted.
    #[inline]
    pub fn claim_next(&self) -> Option<u32> {
        let claimed = self.counter.atomic_add(0, -1);
        u32::try_from(claimed).ok()
    }

    /// Current counter value (negative when exhausted).
    pub fn peek(&self) -> i32 {
        self.counter.load(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmulatedDevice;
    use std::collections::HashSet;

    #[test]
    fn test_tiling_math() {
        assert_eq!(stripe_count(0), 0);
        assert_eq!(stripe_count(1000), 32);
        assert_eq!(stripe_count(1024), 32);
        assert_eq!(stripe_count(1057), 34);
        assert_eq!(tile_count(34), 595);
        assert_eq!(tile_index(0, 0), 0);
        assert_eq!(tile_index(1, 0), 1);
        assert_eq!(tile_index(1, 1), 2);
        assert_eq!(tile_index(33, 33), tile_count(34) - 1);
        assert_eq!(initial_counter(128, 2560), 128 - 2560 - 1);
    }

    #[test]
    fn test_claims_drain_every_stripe_once() {
        let device = EmulatedDevice::new();
        let counter = device.alloc::<i32>(1).unwrap();
        let queue = StripeQueue::new(&counter);

        let nstripes = 10;
        let groups = 3;
        queue.reset(initial_counter(nstripes, groups));

        let mut seen: HashSet<i64> = (0..groups)
            .map(|g| first_stripe(nstripes, g))
            .collect();
        while let Some(stripe) = queue.claim_next() {
            assert!(seen.insert(stripe as i64), "stripe {} claimed twice", stripe);
        }
        assert_eq!(seen, (0..nstripes as i64).collect());
        assert!(queue.peek() < 0);
        assert_eq!(queue.claim_next(), None);
    }

    #[test]
    fn test_more_groups_than_stripes() {
        let device = EmulatedDevice::new();
        let counter = device.alloc::<i32>(1).unwrap();
        let queue = StripeQueue::new(&counter);
        queue.reset(initial_counter(2, 8));
        assert_eq!(queue.claim_next(), None);
        assert_eq!(first_stripe(2, 1), 0);
        assert!(first_stripe(2, 2) < 0);
    }
}
