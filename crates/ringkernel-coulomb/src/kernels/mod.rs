//! Force kernels for the emulated accelerator.
//!
//! Both kernels are plain functions of a [`SyncGroup`](crate::warp::SyncGroup)
//! and a [`ConstantsPackage`]; the helpers below launch them over a grid.

mod init;
mod pairwise;

pub use init::force_initializer;
pub use pairwise::{evaluate_tile, pairwise_tile_evaluator, StripeRegisters, TileForces};

use tracing::debug;

use crate::device::{EmulatedDevice, LaunchGeometry};
use crate::error::Result;
use crate::params::ConstantsPackage;

/// Kernel name of the force initializer.
pub const FORCE_INIT_KERNEL: &str = "force_initializer";

/// Kernel name of the pairwise tile evaluator.
pub const PAIRWISE_KERNEL: &str = "pairwise_tile_evaluator";

/// Launch the force initializer.
pub fn launch_force_initializer(
    device: &EmulatedDevice,
    geometry: LaunchGeometry,
    params: ConstantsPackage<'_>,
) -> Result<()> {
    device.launch(FORCE_INIT_KERNEL, geometry, |group| {
        force_initializer(group, &params)
    })
}

/// Launch the pairwise tile evaluator.
///
/// `geometry` must match the one the initializer ran with.
pub fn launch_pairwise(
    device: &EmulatedDevice,
    geometry: LaunchGeometry,
    params: ConstantsPackage<'_>,
) -> Result<()> {
    device.launch(PAIRWISE_KERNEL, geometry, |group| {
        pairwise_tile_evaluator(group, &params)
    })
}

/// Run both kernels in order and wait for completion.
pub fn evaluate(
    device: &EmulatedDevice,
    geometry: LaunchGeometry,
    params: ConstantsPackage<'_>,
) -> Result<()> {
    debug!(
        "Evaluating {} particles on {} groups",
        params.n(),
        geometry.total_groups()
    );
    launch_force_initializer(device, geometry, params)?;
    launch_pairwise(device, geometry, params)?;
    device.synchronize()
}
