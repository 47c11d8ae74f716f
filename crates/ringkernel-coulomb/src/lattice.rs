//! Particle sets and perturbed cubic lattice generation.

use std::ops::Range;

use rand::prelude::*;
use rand::rngs::StdRng;

use crate::error::{CoulombError, Result};

/// Point particles as parallel arrays sharing one index space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleSet {
    /// X coordinates.
    pub x: Vec<f32>,
    /// Y coordinates.
    pub y: Vec<f32>,
    /// Z coordinates.
    pub z: Vec<f32>,
    /// Charges.
    pub q: Vec<f32>,
}

impl ParticleSet {
    /// Build a set from coordinate and charge arrays of equal length.
    pub fn from_vecs(x: Vec<f32>, y: Vec<f32>, z: Vec<f32>, q: Vec<f32>) -> Result<Self> {
        let n = x.len();
        if y.len() != n || z.len() != n || q.len() != n {
            return Err(CoulombError::InvalidConfig(format!(
                "particle arrays differ in length: x={}, y={}, z={}, q={}",
                n,
                y.len(),
                z.len(),
                q.len()
            )));
        }
        Ok(Self { x, y, z, q })
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Position of particle `i`.
    pub fn position(&self, i: usize) -> [f32; 3] {
        [self.x[i], self.y[i], self.z[i]]
    }
}

/// Perturbed cubic lattice parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeConfig {
    /// Cells per axis; the lattice holds `dim^3` particles.
    pub dim: usize,
    /// Seed of the pseudo-random source.
    pub seed: u64,
    /// Fraction of the unit cell a particle may be displaced within, in `[0, 1)`.
    pub jitter: f32,
    /// Charge range, sampled uniformly.
    pub charge_range: Range<f32>,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            dim: 16,
            seed: 42,
            jitter: 0.5,
            charge_range: 0.1..1.0,
        }
    }
}

impl LatticeConfig {
    /// Create a configuration with `dim` cells per axis.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the jitter fraction.
    pub fn with_jitter(mut self, jitter: f32) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the charge range.
    pub fn with_charge_range(mut self, charge_range: Range<f32>) -> Self {
        self.charge_range = charge_range;
        self
    }

    /// Number of particles generated.
    pub fn particle_count(&self) -> usize {
        self.dim * self.dim * self.dim
    }

    fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(CoulombError::InvalidConfig(
                "lattice dimension must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(CoulombError::InvalidConfig(format!(
                "jitter must lie in [0, 1), got {}",
                self.jitter
            )));
        }
        if self.charge_range.is_empty() {
            return Err(CoulombError::InvalidConfig(format!(
                "empty charge range {:?}",
                self.charge_range
            )));
        }
        Ok(())
    }
}

/// Generate a jittered cubic lattice.
///
/// Particles are laid out x-fastest. Each sits inside its own unit cell, at
/// least `1 - jitter` away from any neighbour along every axis, so no two
/// particles coincide. The output depends only on the configuration.
pub fn perturbed_lattice(config: &LatticeConfig) -> Result<ParticleSet> {
    config.validate()?;

    let n = config.particle_count();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let offset = (1.0 - config.jitter) * 0.5;

    let mut set = ParticleSet {
        x: Vec::with_capacity(n),
        y: Vec::with_capacity(n),
        z: Vec::with_capacity(n),
        q: Vec::with_capacity(n),
    };

    for k in 0..config.dim {
        for j in 0..config.dim {
            for i in 0..config.dim {
                set.x.push(i as f32 + offset + config.jitter * rng.gen::<f32>());
                set.y.push(j as f32 + offset + config.jitter * rng.gen::<f32>());
                set.z.push(k as f32 + offset + config.jitter * rng.gen::<f32>());
                set.q.push(rng.gen_range(config.charge_range.clone()));
            }
        }
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lattice_shape() {
        let set = perturbed_lattice(&LatticeConfig::new(4)).unwrap();
        assert_eq!(set.len(), 64);
        assert_eq!(set.y.len(), 64);
        assert_eq!(set.q.len(), 64);

        for i in 0..set.len() {
            let [x, y, z] = set.position(i);
            assert_eq!(x.floor() as usize, i % 4);
            assert_eq!(y.floor() as usize, (i / 4) % 4);
            assert_eq!(z.floor() as usize, i / 16);
            assert!((0.1..1.0).contains(&set.q[i]));
        }
    }

    #[test]
    fn test_lattice_is_deterministic() {
        let config = LatticeConfig::new(3).with_seed(7);
        assert_eq!(
            perturbed_lattice(&config).unwrap(),
            perturbed_lattice(&config).unwrap()
        );
        let other = perturbed_lattice(&config.clone().with_seed(8)).unwrap();
        assert_ne!(perturbed_lattice(&config).unwrap(), other);
    }

    #[test]
    fn test_invalid_config() {
        assert!(perturbed_lattice(&LatticeConfig::new(0)).is_err());
        assert!(perturbed_lattice(&LatticeConfig::new(2).with_jitter(1.5)).is_err());
        assert!(perturbed_lattice(&LatticeConfig::new(2).with_charge_range(1.0..1.0)).is_err());
    }

    #[test]
    fn test_from_vecs_length_check() {
        assert!(ParticleSet::from_vecs(vec![0.0], vec![0.0], vec![0.0], vec![1.0]).is_ok());
        assert!(ParticleSet::from_vecs(vec![0.0], vec![], vec![0.0], vec![1.0]).is_err());
    }
}
