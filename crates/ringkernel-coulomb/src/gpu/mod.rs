//! GPU-accelerated Coulomb evaluation.
//!
//! This module provides the CUDA implementation of the force kernels. The
//! kernel sources are always available; the cudarc-backed solver is only
//! compiled with the `cuda` feature.

#[cfg(feature = "cuda")]
mod cuda;

#[cfg(feature = "cuda")]
pub use cuda::*;

/// CUDA kernel source for the force initializer and pairwise tile evaluator.
///
/// Both kernels take the constants package by value, so it lives in the
/// kernel parameter bank for the duration of the launch.
pub const COULOMB_KERNEL_SOURCE: &str = r#"
#define WARP_SIZE 32
#define FULL_MASK 0xffffffffu

struct ConstantsPackage {
    unsigned int n;
    float padding_offset;        // padding lanes sit at y = +/- padding_offset
    const float* x;
    const float* y;
    const float* z;
    const float* q;
    float* fx;
    float* fy;
    float* fz;
    int* tile_counter;
    float* energy;
    unsigned int* tile_visits;   // null unless instrumented
};

__device__ __forceinline__ int stripe_count(unsigned int n) {
    return (int)((n + WARP_SIZE - 1) / WARP_SIZE);
}

// Grid-stride zeroing of force accumulators; thread 0 primes the work queue
extern "C" __global__ void force_initializer(ConstantsPackage c) {
    unsigned int tid = blockIdx.x * blockDim.x + threadIdx.x;
    unsigned int stride = gridDim.x * blockDim.x;

    for (unsigned int i = tid; i < c.n; i += stride) {
        c.fx[i] = 0.0f;
        c.fy[i] = 0.0f;
        c.fz[i] = 0.0f;
    }

    if (c.tile_visits != 0) {
        unsigned int nstripes = (unsigned int)stripe_count(c.n);
        unsigned int tiles = nstripes * (nstripes + 1) / 2;
        for (unsigned int i = tid; i < tiles; i += stride) {
            c.tile_visits[i] = 0;
        }
    }

    if (tid == 0) {
        int groups = (int)(gridDim.x * (blockDim.x / WARP_SIZE));
        *c.tile_counter = stripe_count(c.n) - groups - 1;
        *c.energy = 0.0f;
    }
}

// Warp-synchronous triangular tile sweep with dynamic stripe claiming
extern "C" __global__ void pairwise_tile_evaluator(ConstantsPackage c) {
    const int lane = threadIdx.x & (WARP_SIZE - 1);
    const int group = blockIdx.x * (blockDim.x / WARP_SIZE) + threadIdx.x / WARP_SIZE;
    const int n = (int)c.n;
    const int nstripes = stripe_count(c.n);

    float energy = 0.0f;
    int bpos = nstripes - 1 - group;

    while (bpos >= 0) {
        const int pi = bpos * WARP_SIZE + lane;
        float px, py, pz, pq;
        if (pi < n) {
            px = c.x[pi]; py = c.y[pi]; pz = c.z[pi]; pq = c.q[pi];
        } else {
            px = (float)lane; py = c.padding_offset; pz = 0.0f; pq = 0.0f;
        }

        for (int tpos = 0; tpos <= bpos; tpos++) {
            const int ti = tpos * WARP_SIZE + lane;
            float tx, ty, tz, tq;
            if (ti < n) {
                tx = c.x[ti]; ty = c.y[ti]; tz = c.z[ti]; tq = c.q[ti];
            } else {
                tx = (float)lane; ty = -c.padding_offset; tz = 0.0f; tq = 0.0f;
            }

            const bool diagonal = (tpos == bpos);
            const float weight = diagonal ? 0.5f : 1.0f;
            float fpx = 0.0f, fpy = 0.0f, fpz = 0.0f;
            float ftx = 0.0f, fty = 0.0f, ftz = 0.0f;

            for (int step = diagonal ? 1 : 0; step < WARP_SIZE; step++) {
                const int src = (lane + step) & (WARP_SIZE - 1);
                const float sx = __shfl_sync(FULL_MASK, tx, src);
                const float sy = __shfl_sync(FULL_MASK, ty, src);
                const float sz = __shfl_sync(FULL_MASK, tz, src);
                const float sq = __shfl_sync(FULL_MASK, tq, src);

                const float dx = sx - px;
                const float dy = sy - py;
                const float dz = sz - pz;
                const float r2 = dx * dx + dy * dy + dz * dz;
                const float r = sqrtf(r2);
                const float qfac = weight * sq * pq;
                energy += qfac / r;

                const float fmag = qfac / (r2 * r);
                const float fx = dx * fmag;
                const float fy = dy * fmag;
                const float fz = dz * fmag;
                fpx -= fx;
                fpy -= fy;
                fpz -= fz;

                // Return the t-side force to the lane owning that particle
                const int dst = (lane + WARP_SIZE - step) & (WARP_SIZE - 1);
                ftx += __shfl_sync(FULL_MASK, fx, dst);
                fty += __shfl_sync(FULL_MASK, fy, dst);
                ftz += __shfl_sync(FULL_MASK, fz, dst);
            }

            atomicAdd(&c.fx[pi], fpx);
            atomicAdd(&c.fy[pi], fpy);
            atomicAdd(&c.fz[pi], fpz);
            atomicAdd(&c.fx[ti], ftx);
            atomicAdd(&c.fy[ti], fty);
            atomicAdd(&c.fz[ti], ftz);

            if (c.tile_visits != 0 && lane == 0) {
                atomicAdd(&c.tile_visits[bpos * (bpos + 1) / 2 + tpos], 1u);
            }
        }

        int next = 0;
        if (lane == 0) {
            next = atomicSub(c.tile_counter, 1);
        }
        bpos = __shfl_sync(FULL_MASK, next, 0);
    }

    for (int offset = WARP_SIZE / 2; offset > 0; offset >>= 1) {
        energy += __shfl_down_sync(FULL_MASK, energy, offset);
    }
    if (lane == 0) {
        atomicAdd(c.energy, energy);
    }
}
"#;

/// Kernel function names in [`COULOMB_KERNEL_SOURCE`].
pub const COULOMB_KERNEL_NAMES: [&str; 2] = ["force_initializer", "pairwise_tile_evaluator"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_source_entry_points() {
        for name in COULOMB_KERNEL_NAMES {
            let signature = format!("__global__ void {}(ConstantsPackage c)", name);
            assert!(COULOMB_KERNEL_SOURCE.contains(&signature), "missing {}", name);
        }
        assert!(COULOMB_KERNEL_SOURCE.contains("__shfl_sync"));
        assert!(COULOMB_KERNEL_SOURCE.contains("atomicSub(c.tile_counter, 1)"));
        assert!(COULOMB_KERNEL_SOURCE.contains("py = c.padding_offset;"));
        assert!(COULOMB_KERNEL_SOURCE.contains("ty = -c.padding_offset;"));
    }

    #[test]
    fn test_kernel_names_match_emulated_kernels() {
        assert_eq!(COULOMB_KERNEL_NAMES[0], crate::kernels::FORCE_INIT_KERNEL);
        assert_eq!(COULOMB_KERNEL_NAMES[1], crate::kernels::PAIRWISE_KERNEL);
    }
}
