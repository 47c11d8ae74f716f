//! Comparison of accelerator results against the reference solver.

use std::fmt;

use crate::reference::ForceField;

/// Acceptance thresholds for [`Comparison::passes`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    /// Maximum relative energy error.
    pub energy: f64,
    /// Maximum per-component force deviation, relative to `|f_ref| + 1`.
    pub force: f64,
    /// Maximum net force, relative to the summed force magnitudes.
    pub momentum: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            energy: 1e-3,
            force: 1e-3,
            momentum: 1e-3,
        }
    }
}

/// Deviation of a computed force field from the reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    /// Relative energy error.
    pub energy_error: f64,
    /// Worst scaled per-component force deviation.
    pub max_force_error: f64,
    /// Particle with the worst force deviation.
    pub worst_particle: usize,
    /// Net force magnitude relative to the summed force magnitudes.
    pub momentum_residual: f64,
    /// Whether every computed value is finite.
    pub all_finite: bool,
}

impl Comparison {
    /// Check every metric against `tolerances`.
    pub fn passes(&self, tolerances: &Tolerances) -> bool {
        self.all_finite
            && self.energy_error <= tolerances.energy
            && self.max_force_error <= tolerances.force
            && self.momentum_residual <= tolerances.momentum
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "energy error {:.3e}, max force error {:.3e} (particle {}), momentum residual {:.3e}{}",
            self.energy_error,
            self.max_force_error,
            self.worst_particle,
            self.momentum_residual,
            if self.all_finite { "" } else { ", non-finite values" }
        )
    }
}

/// Compare `computed` against `reference`.
///
/// Both fields must describe the same particles; extra entries in the longer
/// one are ignored.
pub fn compare(reference: &ForceField, computed: &ForceField) -> Comparison {
    let n = reference.len().min(computed.len());

    let energy_error = if reference.energy == 0.0 {
        computed.energy.abs()
    } else {
        ((computed.energy - reference.energy) / reference.energy).abs()
    };

    let mut all_finite = computed.energy.is_finite();
    let mut max_force_error = 0.0f64;
    let mut worst_particle = 0;
    let mut magnitude_sum = 0.0f64;

    for i in 0..n {
        let expected = reference.force(i);
        let actual = computed.force(i);
        for (e, a) in expected.iter().zip(actual.iter()) {
            if !a.is_finite() {
                all_finite = false;
                continue;
            }
            let error = f64::from((a - e).abs()) / (f64::from(e.abs()) + 1.0);
            if error > max_force_error {
                max_force_error = error;
                worst_particle = i;
            }
            magnitude_sum += f64::from(a.abs());
        }
    }

    let net = computed.net_force();
    let net_magnitude = (net[0] * net[0] + net[1] * net[1] + net[2] * net[2]).sqrt();
    let momentum_residual = if magnitude_sum > 0.0 {
        net_magnitude / magnitude_sum
    } else {
        net_magnitude
    };

    Comparison {
        energy_error,
        max_force_error,
        worst_particle,
        momentum_residual,
        all_finite,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(energy: f64, fx: Vec<f32>) -> ForceField {
        let n = fx.len();
        ForceField {
            energy,
            fx,
            fy: vec![0.0; n],
            fz: vec![0.0; n],
        }
    }

    #[test]
    fn test_identical_fields_pass() {
        let a = field(10.0, vec![1.0, -1.0]);
        let cmp = compare(&a, &a.clone());
        assert_eq!(cmp.energy_error, 0.0);
        assert_eq!(cmp.max_force_error, 0.0);
        assert_eq!(cmp.momentum_residual, 0.0);
        assert!(cmp.passes(&Tolerances::default()));
    }

    #[test]
    fn test_deviations_detected() {
        let reference = field(10.0, vec![1.0, -1.0]);

        let cmp = compare(&reference, &field(10.1, vec![1.0, -1.0]));
        assert!((cmp.energy_error - 0.01).abs() < 1e-12);
        assert!(!cmp.passes(&Tolerances::default()));

        let cmp = compare(&reference, &field(10.0, vec![1.0, -0.5]));
        assert_eq!(cmp.worst_particle, 1);
        assert!((cmp.max_force_error - 0.25).abs() < 1e-6);
        assert!((cmp.momentum_residual - 0.5 / 1.5).abs() < 1e-6);
        assert!(!cmp.passes(&Tolerances::default()));
    }

    #[test]
    fn test_non_finite_fails() {
        let reference = field(1.0, vec![0.0]);
        let cmp = compare(&reference, &field(1.0, vec![f32::NAN]));
        assert!(!cmp.all_finite);
        assert!(!cmp.passes(&Tolerances::default()));
        assert!(cmp.to_string().contains("non-finite"));
    }
}
