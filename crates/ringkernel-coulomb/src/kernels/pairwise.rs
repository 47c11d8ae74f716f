//! Warp-synchronous pairwise Coulomb evaluation over triangular tiles.
//!
//! A group owns one row stripe `bpos` at a time and sweeps the tiles
//! `(bpos, 0..=bpos)`. Inside a tile every lane holds one p-particle (row) and
//! one t-particle (column) in registers. The t registers are rotated through
//! the group so that after 32 steps each lane has met every t-particle once.
//! Forces produced for the t side are rotated back to the lane that owns the
//! t-particle, so each pair is evaluated once and applied to both ends.

use crate::params::ConstantsPackage;
use crate::queue::{first_stripe, tile_index};
use crate::warp::{Lanes, SyncGroup, WARP_SIZE};

/// Register file for one stripe of 32 particles.
#[derive(Debug, Clone, Copy)]
pub struct StripeRegisters {
    /// X coordinates.
    pub x: Lanes<f32>,
    /// Y coordinates.
    pub y: Lanes<f32>,
    /// Z coordinates.
    pub z: Lanes<f32>,
    /// Charges.
    pub q: Lanes<f32>,
}

impl StripeRegisters {
    /// Load stripe `stripe`, replacing indices past `n` with uncharged dummies.
    ///
    /// Dummies sit on the line `y = dummy_y`, spaced one unit apart along x by
    /// lane number. Callers pass `±params.padding_offset()`, which lies beyond
    /// every real coordinate, so no dummy coincides with a real particle or a
    /// dummy of the other side.
    pub fn load(params: &ConstantsPackage<'_>, stripe: usize, dummy_y: f32) -> Self {
        let [xs, ys, zs] = params.positions();
        let qs = params.charges();
        let n = params.n();
        let base = stripe * WARP_SIZE;

        let mut regs = Self {
            x: [0.0; WARP_SIZE],
            y: [0.0; WARP_SIZE],
            z: [0.0; WARP_SIZE],
            q: [0.0; WARP_SIZE],
        };
        for lane in 0..WARP_SIZE {
            let i = base + lane;
            if i < n {
                regs.x[lane] = xs.load(i);
                regs.y[lane] = ys.load(i);
                regs.z[lane] = zs.load(i);
                regs.q[lane] = qs.load(i);
            } else {
                regs.x[lane] = lane as f32;
                regs.y[lane] = dummy_y;
            }
        }
        regs
    }

    fn rotated(&self, group: &SyncGroup, step: usize) -> Self {
        Self {
            x: group.rotate_down(&self.x, step),
            y: group.rotate_down(&self.y, step),
            z: group.rotate_down(&self.z, step),
            q: group.rotate_down(&self.q, step),
        }
    }
}

/// Per-lane force partials for one tile.
#[derive(Debug, Clone, Copy)]
pub struct TileForces {
    /// Force on each lane's p-particle, per axis.
    pub p: [Lanes<f32>; 3],
    /// Force on each lane's t-particle, per axis.
    pub t: [Lanes<f32>; 3],
}

/// Evaluate all interactions between stripes `bpos` and `tpos`.
///
/// Adds each lane's energy contribution to `energy` and returns the force
/// partials. Diagonal tiles skip the zero offset and weight every pair by one
/// half, since each unordered pair is met once from each side.
pub fn evaluate_tile(
    group: &SyncGroup,
    p: &StripeRegisters,
    t: &StripeRegisters,
    diagonal: bool,
    energy: &mut Lanes<f32>,
) -> TileForces {
    let (first_step, weight) = if diagonal { (1, 0.5f32) } else { (0, 1.0f32) };
    let mut forces = TileForces {
        p: [[0.0; WARP_SIZE]; 3],
        t: [[0.0; WARP_SIZE]; 3],
    };

    for step in first_step..WARP_SIZE {
        let partner = t.rotated(group, step);
        let mut f = [[0.0f32; WARP_SIZE]; 3];

        for lane in 0..WARP_SIZE {
            let dx = partner.x[lane] - p.x[lane];
            let dy = partner.y[lane] - p.y[lane];
            let dz = partner.z[lane] - p.z[lane];
            let r2 = dx * dx + dy * dy + dz * dz;
            let r = r2.sqrt();
            let qfac = weight * partner.q[lane] * p.q[lane];
            energy[lane] += qfac / r;

            let fmag = qfac / (r2 * r);
            f[0][lane] = dx * fmag;
            f[1][lane] = dy * fmag;
            f[2][lane] = dz * fmag;
            for axis in 0..3 {
                forces.p[axis][lane] -= f[axis][lane];
            }
        }

        // Hand each t-side force back to the lane that owns the t-particle.
        for axis in 0..3 {
            let back = group.rotate_up(&f[axis], step);
            for (acc, value) in forces.t[axis].iter_mut().zip(back.iter()) {
                *acc += *value;
            }
        }
    }

    forces
}

/// Pairwise tile evaluator kernel body for one synchronization group.
///
/// The group starts on its statically assigned stripe and keeps claiming
/// stripes from the shared queue until it is exhausted. Force partials are
/// added atomically after every tile; the group's energy is reduced across
/// lanes once and added atomically by the first lane.
pub fn pairwise_tile_evaluator(group: &SyncGroup, params: &ConstantsPackage<'_>) {
    let nstripes = params.stripes();
    let queue = params.queue();
    let forces = params.forces();
    let offset = params.padding_offset();
    let mut energy: Lanes<f32> = [0.0; WARP_SIZE];

    let mut bpos = first_stripe(nstripes, group.global_index());
    while bpos >= 0 {
        let row = bpos as usize;
        let p = StripeRegisters::load(params, row, offset);

        for col in 0..=row {
            let t = StripeRegisters::load(params, col, -offset);
            let tile = evaluate_tile(group, &p, &t, row == col, &mut energy);

            let p_base = row * WARP_SIZE;
            let t_base = col * WARP_SIZE;
            for axis in 0..3 {
                for lane in 0..WARP_SIZE {
                    forces[axis].atomic_add(p_base + lane, tile.p[axis][lane]);
                    forces[axis].atomic_add(t_base + lane, tile.t[axis][lane]);
                }
            }

            if let Some(visits) = params.tile_visits() {
                group.first_lane(|| visits.atomic_add(tile_index(row, col), 1));
            }
        }

        bpos = group
            .first_lane(|| queue.claim_next())
            .map_or(-1, i64::from);
    }

    let total = group.reduce_sum(energy);
    group.first_lane(|| params.energy().atomic_add(0, total));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LaunchGeometry;

    fn group() -> SyncGroup {
        SyncGroup::new(LaunchGeometry::new(1, 32), 0)
    }

    fn registers(positions: impl Fn(usize) -> [f32; 3], q: f32) -> StripeRegisters {
        let mut regs = StripeRegisters {
            x: [0.0; WARP_SIZE],
            y: [0.0; WARP_SIZE],
            z: [0.0; WARP_SIZE],
            q: [q; WARP_SIZE],
        };
        for lane in 0..WARP_SIZE {
            let [x, y, z] = positions(lane);
            regs.x[lane] = x;
            regs.y[lane] = y;
            regs.z[lane] = z;
        }
        regs
    }

    #[test]
    fn test_off_diagonal_tile_balances_forces() {
        let p = registers(|lane| [lane as f32, 0.0, 0.0], 1.0);
        let t = registers(|lane| [lane as f32, 2.0, 0.5], 0.5);
        let mut energy = [0.0; WARP_SIZE];
        let tile = evaluate_tile(&group(), &p, &t, false, &mut energy);

        for axis in 0..3 {
            let net: f32 = tile.p[axis].iter().chain(tile.t[axis].iter()).sum();
            assert!(net.abs() < 1e-4, "axis {} net force {}", axis, net);
        }
        // Row particles sit below the column stripe: pushed towards -y.
        assert!(tile.p[1].iter().all(|&f| f < 0.0));
        assert!(tile.t[1].iter().all(|&f| f > 0.0));

        let mut expected = 0.0f64;
        for i in 0..WARP_SIZE {
            for j in 0..WARP_SIZE {
                let dx = j as f64 - i as f64;
                expected += 0.5 / (dx * dx + 4.25).sqrt();
            }
        }
        let total: f32 = energy.iter().sum();
        assert!(((total as f64 - expected) / expected).abs() < 1e-5);
    }

    #[test]
    fn test_diagonal_tile_counts_pairs_once() {
        let p = registers(|lane| [lane as f32 * 1.5, 0.0, 0.0], 1.0);
        let mut energy = [0.0; WARP_SIZE];
        let tile = evaluate_tile(&group(), &p, &p, true, &mut energy);

        let mut expected = 0.0f64;
        let mut expected_fx = [0.0f64; WARP_SIZE];
        for i in 0..WARP_SIZE {
            for j in (i + 1)..WARP_SIZE {
                let d = (j - i) as f64 * 1.5;
                expected += 1.0 / d;
                expected_fx[i] -= 1.0 / (d * d);
                expected_fx[j] += 1.0 / (d * d);
            }
        }
        let total: f32 = energy.iter().sum();
        assert!(((total as f64 - expected) / expected).abs() < 1e-5);

        for lane in 0..WARP_SIZE {
            let fx = (tile.p[0][lane] + tile.t[0][lane]) as f64;
            assert!(
                (fx - expected_fx[lane]).abs() < 1e-4 * (expected_fx[lane].abs() + 1.0),
                "lane {}: {} vs {}",
                lane,
                fx,
                expected_fx[lane]
            );
            assert!(tile.p[0][lane].is_finite() && tile.t[0][lane].is_finite());
        }
    }

    #[test]
    fn test_dummy_lanes_are_inert() {
        // Only lanes 0..3 are real on both sides; the rest are padding.
        let pad = |regs: &mut StripeRegisters, dummy_y: f32| {
            for lane in 3..WARP_SIZE {
                regs.x[lane] = lane as f32;
                regs.y[lane] = dummy_y;
                regs.z[lane] = 0.0;
                regs.q[lane] = 0.0;
            }
        };
        let mut p = registers(|lane| [lane as f32, 0.3, 0.0], 1.0);
        let mut t = registers(|lane| [lane as f32, 0.3, 0.0], 1.0);
        pad(&mut p, 1.0e5);
        pad(&mut t, -1.0e5);

        let mut energy = [0.0; WARP_SIZE];
        let tile = evaluate_tile(&group(), &p, &t, true, &mut energy);
        let total: f32 = energy.iter().sum();
        assert!((total - 2.5).abs() < 1e-6);
        for axis in 0..3 {
            for lane in 3..WARP_SIZE {
                assert_eq!(tile.p[axis][lane], 0.0);
                assert_eq!(tile.t[axis][lane], 0.0);
            }
            assert!(tile.p[axis].iter().all(|f| f.is_finite()));
        }
    }
}
