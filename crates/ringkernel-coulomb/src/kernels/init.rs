//! Force accumulator initialization.

use crate::params::ConstantsPackage;
use crate::queue::initial_counter;
use crate::warp::SyncGroup;

/// Zero the force accumulators and prime the stripe queue.
///
/// Every lane walks the particle range with a grid-wide stride, so coverage
/// does not depend on the grid size. The first lane of group 0 resets the
/// tile counter from the launch geometry and clears the energy accumulator.
/// The pairwise kernel must be launched with the same geometry.
pub fn force_initializer(group: &SyncGroup, params: &ConstantsPackage<'_>) {
    let n = params.n() as u64;
    let stride = group.geometry().total_threads();
    let forces = params.forces();

    for tid in group.global_thread_ids() {
        let mut i = tid;
        while i < n {
            for axis in forces {
                axis.store(i as usize, 0.0);
            }
            i += stride;
        }
    }

    if let Some(visits) = params.tile_visits() {
        let tiles = visits.len() as u64;
        for tid in group.global_thread_ids() {
            let mut i = tid;
            while i < tiles {
                visits.store(i as usize, 0);
                i += stride;
            }
        }
    }

    if group.global_index() == 0 {
        group.first_lane(|| {
            let total_groups = group.geometry().total_groups();
            params
                .queue()
                .reset(initial_counter(params.stripes(), total_groups));
            params.energy().store(0, 0.0);
        });
    }
}
