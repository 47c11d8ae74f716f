//! Synchronization groups (warps).
//!
//! A [`SyncGroup`] is a fixed set of [`WARP_SIZE`] lanes that execute in
//! lockstep. Per-lane registers are carried as [`Lanes`] arrays, and the
//! exchange operations below consume and produce whole register files, so
//! every exchange is implicitly a barrier across exactly the lanes of the
//! group. No scratch memory is involved.

use crate::device::LaunchGeometry;

/// Lanes per synchronization group.
pub const WARP_SIZE: usize = 32;

const LANE_MASK: usize = WARP_SIZE - 1;

/// One register per lane.
pub type Lanes<T> = [T; WARP_SIZE];

/// A group of lanes within a kernel launch.
#[derive(Debug, Clone, Copy)]
pub struct SyncGroup {
    geometry: LaunchGeometry,
    global_index: u32,
}

impl SyncGroup {
    pub(crate) fn new(geometry: LaunchGeometry, global_index: u32) -> Self {
        Self {
            geometry,
            global_index,
        }
    }

    /// Launch geometry this group belongs to.
    #[inline]
    pub fn geometry(&self) -> LaunchGeometry {
        self.geometry
    }

    /// Index of this group across the whole grid.
    #[inline]
    pub fn global_index(&self) -> u32 {
        self.global_index
    }

    /// Block containing this group.
    #[inline]
    pub fn block_index(&self) -> u32 {
        self.global_index / self.geometry.groups_per_block()
    }

    /// Position of this group within its block.
    #[inline]
    pub fn index_in_block(&self) -> u32 {
        self.global_index % self.geometry.groups_per_block()
    }

    /// Lane ids `0..WARP_SIZE`.
    #[inline]
    pub fn lane_ids(&self) -> Lanes<u32> {
        std::array::from_fn(|lane| lane as u32)
    }

    /// Global thread id of every lane.
    #[inline]
    pub fn global_thread_ids(&self) -> Lanes<u64> {
        let base = self.block_index() as u64 * self.geometry.threads_per_block as u64
            + self.index_in_block() as u64 * WARP_SIZE as u64;
        std::array::from_fn(|lane| base + lane as u64)
    }

    /// Indexed exchange: lane `l` receives `values[src_lane(l) % WARP_SIZE]`.
    #[inline]
    pub fn shuffle<T: Copy>(&self, values: &Lanes<T>, src_lane: impl Fn(usize) -> usize) -> Lanes<T> {
        std::array::from_fn(|lane| values[src_lane(lane) & LANE_MASK])
    }

    /// Lane `l` receives the value of lane `(l + delta) % WARP_SIZE`.
    #[inline]
    pub fn rotate_down<T: Copy>(&self, values: &Lanes<T>, delta: usize) -> Lanes<T> {
        self.shuffle(values, |lane| lane + delta)
    }

    /// Lane `l` receives the value of lane `(l - delta) % WARP_SIZE`.
    ///
    /// Inverse of [`rotate_down`](Self::rotate_down) with the same `delta`.
    #[inline]
    pub fn rotate_up<T: Copy>(&self, values: &Lanes<T>, delta: usize) -> Lanes<T> {
        self.shuffle(values, |lane| lane + WARP_SIZE - (delta & LANE_MASK))
    }

    /// Lane `l` receives the value of lane `l + delta`, or keeps its own
    /// value when that lane is out of range.
    #[inline]
    pub fn shuffle_down<T: Copy>(&self, values: &Lanes<T>, delta: usize) -> Lanes<T> {
        std::array::from_fn(|lane| {
            let src = lane + delta;
            if src < WARP_SIZE {
                values[src]
            } else {
                values[lane]
            }
        })
    }

    /// Tree sum over all lanes, halving the active span each step.
    ///
    /// The total ends up in lane 0, which is returned.
    pub fn reduce_sum(&self, values: Lanes<f32>) -> f32 {
        let mut acc = values;
        let mut offset = WARP_SIZE / 2;
        while offset > 0 {
            let shifted = self.shuffle_down(&acc, offset);
            for (a, s) in acc.iter_mut().zip(shifted.iter()) {
                *a += *s;
            }
            offset /= 2;
        }
        acc[0]
    }

    /// Run `f` on the first lane only and broadcast its result to the group.
    #[inline]
    pub fn first_lane<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> SyncGroup {
        SyncGroup::new(LaunchGeometry::new(2, 128), 5)
    }

    #[test]
    fn test_group_identity() {
        let g = group();
        assert_eq!(g.block_index(), 1);
        assert_eq!(g.index_in_block(), 1);
        let ids = g.global_thread_ids();
        assert_eq!(ids[0], 128 + 32);
        assert_eq!(ids[31], 128 + 63);
    }

    #[test]
    fn test_rotations_are_inverse() {
        let g = group();
        let values: Lanes<u32> = g.lane_ids();
        for delta in 0..WARP_SIZE {
            let down = g.rotate_down(&values, delta);
            assert_eq!(down[0], delta as u32);
            assert_eq!(down[31], ((31 + delta) % WARP_SIZE) as u32);
            assert_eq!(g.rotate_up(&down, delta), values);
        }
    }

    #[test]
    fn test_shuffle_down_keeps_out_of_range() {
        let g = group();
        let values = g.lane_ids();
        let shifted = g.shuffle_down(&values, 16);
        assert_eq!(shifted[0], 16);
        assert_eq!(shifted[15], 31);
        assert_eq!(shifted[16], 16);
        assert_eq!(shifted[31], 31);
    }

    #[test]
    fn test_reduce_sum() {
        let g = group();
        let values: Lanes<f32> = std::array::from_fn(|lane| lane as f32);
        assert_eq!(g.reduce_sum(values), 496.0);
        assert_eq!(g.reduce_sum([0.5; WARP_SIZE]), 16.0);
    }
}
