//! Warp-synchronous pairwise Coulomb force and energy evaluation.
//!
//! This crate evaluates all `N(N-1)/2` pairwise Coulomb interactions of a set
//! of point charges on a data-parallel accelerator and cross-checks the result
//! against a sequential reference solver.
//!
//! # Features
//!
//! - **Triangular tiling**: the interaction matrix is cut into 32 x 32 tiles of
//!   the lower triangle, each evaluated by one synchronization group of 32 lanes
//! - **Dynamic work stealing**: groups claim row stripes from a lock-free,
//!   device-resident counter
//! - **Register-only exchange**: lanes rotate particle data through the group;
//!   no scratch memory is used
//! - **Atomic accumulation**: forces and energy are added with atomics only
//! - **Backends**: an emulated accelerator on the rayon thread pool, and CUDA
//!   via cudarc behind the `cuda` feature
//!
//! # Example
//!
//! ```
//! use ringkernel_coulomb::prelude::*;
//!
//! let particles = perturbed_lattice(&LatticeConfig::new(4)).unwrap();
//! let device = EmulatedDevice::new();
//! let computed = solve_emulated(
//!     &device,
//!     &particles,
//!     LaunchGeometry::new(2, 64),
//!     HostMemory::Pinned,
//! )
//! .unwrap();
//!
//! let reference = ringkernel_coulomb::reference::solve(&particles);
//! assert!(compare(&reference, &computed).passes(&Tolerances::default()));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod device;
pub mod driver;
pub mod error;
pub mod kernels;
pub mod lattice;
pub mod params;
pub mod queue;
pub mod reference;
pub mod validate;
pub mod warp;

/// CUDA kernel sources and, with the `cuda` feature, the GPU solver.
pub mod gpu;

pub use error::{CoulombError, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::buffer::{HostMemory, MirroredBuffer, PinnedMemory};
    pub use crate::device::{DeviceSlice, EmulatedDevice, LaunchGeometry};
    pub use crate::driver::{
        run, run_with_progress, solve_emulated, Backend, PhaseTimings, RunConfig, RunReport,
    };
    pub use crate::lattice::{perturbed_lattice, LatticeConfig, ParticleSet};
    pub use crate::params::{ConstantsPackage, ParticleBuffers};
    pub use crate::queue::StripeQueue;
    pub use crate::reference::ForceField;
    pub use crate::validate::{compare, Comparison, Tolerances};
    pub use crate::warp::{Lanes, SyncGroup, WARP_SIZE};
    pub use crate::{CoulombError, Result};

    #[cfg(feature = "cuda")]
    pub use crate::gpu::{GpuCoulombSolver, GpuSolution};
}

// Re-exports
pub use buffer::{HostMemory, MirroredBuffer};
pub use device::{EmulatedDevice, LaunchGeometry};
pub use driver::{run, Backend, RunConfig, RunReport};
pub use lattice::{LatticeConfig, ParticleSet};
pub use params::ConstantsPackage;
pub use reference::ForceField;
