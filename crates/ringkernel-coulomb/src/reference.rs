//! Sequential reference solver.
//!
//! Evaluates the same force law with the same sign convention as the
//! accelerator kernels, one pair at a time, accumulating in f64. Used only
//! to validate accelerator results.

use tracing::debug;

use crate::lattice::ParticleSet;

/// Total energy and per-particle forces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForceField {
    /// Total potential energy.
    pub energy: f64,
    /// Force x components.
    pub fx: Vec<f32>,
    /// Force y components.
    pub fy: Vec<f32>,
    /// Force z components.
    pub fz: Vec<f32>,
}

impl ForceField {
    /// Number of particles.
    pub fn len(&self) -> usize {
        self.fx.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.fx.is_empty()
    }

    /// Force on particle `i`.
    pub fn force(&self, i: usize) -> [f32; 3] {
        [self.fx[i], self.fy[i], self.fz[i]]
    }

    /// Sum of all force vectors.
    pub fn net_force(&self) -> [f64; 3] {
        let mut net = [0.0f64; 3];
        for i in 0..self.len() {
            for (acc, f) in net.iter_mut().zip(self.force(i)) {
                *acc += f64::from(f);
            }
        }
        net
    }
}

/// Solve without progress reporting.
pub fn solve(particles: &ParticleSet) -> ForceField {
    solve_with_progress(particles, |_, _| {})
}

/// Sequential triangular solve.
///
/// `progress(done, total)` is called after each outer row.
pub fn solve_with_progress(
    particles: &ParticleSet,
    mut progress: impl FnMut(usize, usize),
) -> ForceField {
    let n = particles.len();
    let mut energy = 0.0f64;
    let mut forces = vec![[0.0f64; 3]; n];

    for i in 0..n {
        let pi = particles.position(i).map(f64::from);
        let qi = f64::from(particles.q[i]);

        for j in (i + 1)..n {
            let pj = particles.position(j).map(f64::from);
            let d = [pj[0] - pi[0], pj[1] - pi[1], pj[2] - pi[2]];
            let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
            let r = r2.sqrt();
            let qq = qi * f64::from(particles.q[j]);

            energy += qq / r;
            let fmag = qq / (r2 * r);
            for axis in 0..3 {
                let f = d[axis] * fmag;
                forces[i][axis] -= f;
                forces[j][axis] += f;
            }
        }

        progress(i + 1, n);
    }

    debug!(n = n, energy = energy, "Reference solve complete");

    ForceField {
        energy,
        fx: forces.iter().map(|f| f[0] as f32).collect(),
        fy: forces.iter().map(|f| f[1] as f32).collect(),
        fz: forces.iter().map(|f| f[2] as f32).collect(),
    }
}
