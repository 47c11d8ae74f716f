//! CUDA implementation of the Coulomb force kernels.

use std::sync::Arc;

use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, DevicePtr, DeviceRepr, LaunchConfig,
    PushKernelArg, ValidAsZeroBits,
};
use cudarc::nvrtc::compile_ptx;
use tracing::{debug, info};

use super::COULOMB_KERNEL_SOURCE;
use crate::buffer::{byte_size, host_vec, padded_len};
use crate::device::LaunchGeometry;
use crate::error::{CoulombError, Result};
use crate::lattice::ParticleSet;
use crate::params::padding_offset;
use crate::queue::{stripe_count, tile_count};
use crate::reference::ForceField;

/// Constants package as laid out in device parameter memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ConstantsRecord {
    /// Particle count.
    pub n: u32,
    /// Padding lanes sit at `y = ±padding_offset`.
    pub padding_offset: f32,
    /// X coordinates.
    pub x: u64,
    /// Y coordinates.
    pub y: u64,
    /// Z coordinates.
    pub z: u64,
    /// Charges.
    pub q: u64,
    /// Force x accumulators.
    pub fx: u64,
    /// Force y accumulators.
    pub fy: u64,
    /// Force z accumulators.
    pub fz: u64,
    /// Shared stripe counter.
    pub tile_counter: u64,
    /// Energy accumulator.
    pub energy: u64,
    /// Tile-visit counters, or 0.
    pub tile_visits: u64,
}

// SAFETY: ConstantsRecord is #[repr(C)] plain data matching the CUDA struct
// `ConstantsPackage` field for field.
unsafe impl DeviceRepr for ConstantsRecord {}

/// Host `Vec` mirrored by a padded device allocation.
pub struct CudaMirroredBuffer<T: DeviceRepr + ValidAsZeroBits + Default + Clone> {
    len: usize,
    host: Vec<T>,
    device: CudaSlice<T>,
}

impl<T: DeviceRepr + ValidAsZeroBits + Default + Clone + Unpin> CudaMirroredBuffer<T> {
    /// Allocate zeroed host and device storage for `len` elements.
    pub fn new(stream: &Arc<CudaStream>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(CoulombError::InvalidConfig(
                "mirrored buffer length must be positive".to_string(),
            ));
        }
        let capacity = padded_len(len).ok_or(CoulombError::AllocationFailed {
            requested: usize::MAX,
            available: 0,
        })?;
        let device = stream.alloc_zeros::<T>(capacity).map_err(|e| {
            debug!("cuMemAlloc of {} elements failed: {}", capacity, e);
            CoulombError::AllocationFailed {
                requested: byte_size::<T>(capacity),
                available: 0,
            }
        })?;
        Ok(Self {
            len,
            host: host_vec(capacity)?,
            device,
        })
    }

    /// Logical element count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host-side elements.
    pub fn host(&self) -> &[T] {
        &self.host[..self.len]
    }

    /// Mutable host-side elements.
    pub fn host_mut(&mut self) -> &mut [T] {
        &mut self.host[..self.len]
    }

    /// Copy host to device (full capacity).
    pub fn upload(&mut self, stream: &Arc<CudaStream>) -> Result<()> {
        stream
            .memcpy_htod(&self.host, &mut self.device)
            .map_err(|e| CoulombError::TransferFailed(e.to_string()))
    }

    /// Copy device to host (full capacity).
    pub fn download(&mut self, stream: &Arc<CudaStream>) -> Result<()> {
        stream
            .memcpy_dtoh(&self.device, &mut self.host)
            .map_err(|e| CoulombError::TransferFailed(e.to_string()))
    }

    fn device_ptr(&self, stream: &Arc<CudaStream>) -> u64 {
        let (ptr, _sync) = self.device.device_ptr(stream);
        ptr
    }
}

struct CudaParticleBuffers {
    n: usize,
    positions: [CudaMirroredBuffer<f32>; 3],
    charges: CudaMirroredBuffer<f32>,
    forces: [CudaMirroredBuffer<f32>; 3],
    tile_counter: CudaMirroredBuffer<i32>,
    energy: CudaMirroredBuffer<f32>,
    tile_visits: Option<CudaMirroredBuffer<u32>>,
}

impl CudaParticleBuffers {
    fn new(stream: &Arc<CudaStream>, n: usize, instrumented: bool) -> Result<Self> {
        let f32_buffer = || CudaMirroredBuffer::<f32>::new(stream, n);
        Ok(Self {
            n,
            positions: [f32_buffer()?, f32_buffer()?, f32_buffer()?],
            charges: f32_buffer()?,
            forces: [f32_buffer()?, f32_buffer()?, f32_buffer()?],
            tile_counter: CudaMirroredBuffer::new(stream, 1)?,
            energy: CudaMirroredBuffer::new(stream, 1)?,
            tile_visits: if instrumented {
                Some(CudaMirroredBuffer::new(stream, tile_count(stripe_count(n)))?)
            } else {
                None
            },
        })
    }

    fn record(&self, stream: &Arc<CudaStream>) -> Result<ConstantsRecord> {
        let n = u32::try_from(self.n).map_err(|_| {
            CoulombError::InvalidConfig(format!("{} particles exceed 32-bit indexing", self.n))
        })?;
        let coordinates = self
            .positions
            .iter()
            .flat_map(|axis| axis.host().iter().copied());
        Ok(ConstantsRecord {
            n,
            padding_offset: padding_offset(coordinates)?,
            x: self.positions[0].device_ptr(stream),
            y: self.positions[1].device_ptr(stream),
            z: self.positions[2].device_ptr(stream),
            q: self.charges.device_ptr(stream),
            fx: self.forces[0].device_ptr(stream),
            fy: self.forces[1].device_ptr(stream),
            fz: self.forces[2].device_ptr(stream),
            tile_counter: self.tile_counter.device_ptr(stream),
            energy: self.energy.device_ptr(stream),
            tile_visits: self
                .tile_visits
                .as_ref()
                .map_or(0, |visits| visits.device_ptr(stream)),
        })
    }
}

/// Result of a CUDA solve.
#[derive(Debug, Clone)]
pub struct GpuSolution {
    /// Energy and forces.
    pub field: ForceField,
    /// Per-tile visit counts, when instrumented.
    pub tile_visits: Option<Vec<u32>>,
}

/// CUDA-backed pairwise Coulomb solver.
pub struct GpuCoulombSolver {
    _context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    force_initializer: CudaFunction,
    pairwise: CudaFunction,
}

impl GpuCoulombSolver {
    /// Create a solver on the given device and compile the kernels.
    pub fn new(device_ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(device_ordinal)
            .map_err(|e| CoulombError::BackendUnavailable(e.to_string()))?;
        let stream = context.default_stream();

        let ptx = compile_ptx(COULOMB_KERNEL_SOURCE)
            .map_err(|e| CoulombError::BackendUnavailable(format!("NVRTC: {}", e)))?;
        let module = context
            .load_module(ptx)
            .map_err(|e| CoulombError::LaunchFailed(e.to_string()))?;
        let force_initializer = module
            .load_function(super::COULOMB_KERNEL_NAMES[0])
            .map_err(|e| CoulombError::LaunchFailed(e.to_string()))?;
        let pairwise = module
            .load_function(super::COULOMB_KERNEL_NAMES[1])
            .map_err(|e| CoulombError::LaunchFailed(e.to_string()))?;

        info!("CUDA Coulomb solver ready on device {}", device_ordinal);

        Ok(Self {
            _context: context,
            stream,
            force_initializer,
            pairwise,
        })
    }

    /// Evaluate energy and forces for `particles`.
    pub fn solve(&self, particles: &ParticleSet, geometry: LaunchGeometry) -> Result<ForceField> {
        self.run(particles, geometry, false).map(|solution| solution.field)
    }

    /// Evaluate and also record how often each tile was visited.
    pub fn solve_instrumented(
        &self,
        particles: &ParticleSet,
        geometry: LaunchGeometry,
    ) -> Result<GpuSolution> {
        self.run(particles, geometry, true)
    }

    fn run(
        &self,
        particles: &ParticleSet,
        geometry: LaunchGeometry,
        instrumented: bool,
    ) -> Result<GpuSolution> {
        geometry.validate()?;
        let n = particles.len();
        let mut buffers = CudaParticleBuffers::new(&self.stream, n, instrumented)?;

        let sources = [&particles.x, &particles.y, &particles.z];
        for (buffer, source) in buffers.positions.iter_mut().zip(sources) {
            buffer.host_mut().copy_from_slice(source);
            buffer.upload(&self.stream)?;
        }
        buffers.charges.host_mut().copy_from_slice(&particles.q);
        buffers.charges.upload(&self.stream)?;

        let record = buffers.record(&self.stream)?;
        let config = LaunchConfig {
            grid_dim: (geometry.blocks, 1, 1),
            block_dim: (geometry.threads_per_block, 1, 1),
            shared_mem_bytes: 0,
        };

        debug!(
            "Launching CUDA kernels (n={}, grid={}, block={})",
            n, geometry.blocks, geometry.threads_per_block
        );

        // SAFETY: The record holds live device pointers owned by `buffers`,
        // each padded to a multiple of 128 elements, and matches the
        // ConstantsPackage struct of the compiled PTX.
        unsafe {
            self.stream
                .launch_builder(&self.force_initializer)
                .arg(&record)
                .launch(config)
                .map_err(|e| CoulombError::LaunchFailed(e.to_string()))?;
            self.stream
                .launch_builder(&self.pairwise)
                .arg(&record)
                .launch(config)
                .map_err(|e| CoulombError::LaunchFailed(e.to_string()))?;
        }

        self.stream
            .synchronize()
            .map_err(|e| CoulombError::SyncFailed(e.to_string()))?;

        for buffer in buffers.forces.iter_mut() {
            buffer.download(&self.stream)?;
        }
        buffers.energy.download(&self.stream)?;
        let tile_visits = match buffers.tile_visits.as_mut() {
            Some(visits) => {
                visits.download(&self.stream)?;
                Some(visits.host().to_vec())
            }
            None => None,
        };

        Ok(GpuSolution {
            field: ForceField {
                energy: f64::from(buffers.energy.host()[0]),
                fx: buffers.forces[0].host().to_vec(),
                fy: buffers.forces[1].host().to_vec(),
                fz: buffers.forces[2].host().to_vec(),
            },
            tile_visits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{perturbed_lattice, LatticeConfig};
    use crate::validate::{compare, Tolerances};

    #[test]
    fn test_record_layout() {
        assert_eq!(std::mem::size_of::<ConstantsRecord>(), 88);
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_gpu_matches_reference() {
        let solver = GpuCoulombSolver::new(0).expect("CUDA device");
        let particles = perturbed_lattice(&LatticeConfig::new(8)).unwrap();
        let field = solver.solve(&particles, LaunchGeometry::default()).unwrap();
        let reference = crate::reference::solve(&particles);
        assert!(compare(&reference, &field).passes(&Tolerances::default()));
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_gpu_particle_on_far_line() {
        let solver = GpuCoulombSolver::new(0).expect("CUDA device");
        let mut x: Vec<f32> = (0..33).map(|i| i as f32).collect();
        let mut y = vec![0.0; 33];
        x[3] = 5.0;
        y[3] = 1.0e5;
        let particles = ParticleSet::from_vecs(x, y, vec![0.0; 33], vec![1.0; 33]).unwrap();
        let field = solver.solve(&particles, LaunchGeometry::new(1, 64)).unwrap();
        let reference = crate::reference::solve(&particles);
        let comparison = compare(&reference, &field);
        assert!(comparison.all_finite, "{}", comparison);
        assert!(comparison.passes(&Tolerances::default()), "{}", comparison);
    }

    #[test]
    #[ignore] // Requires CUDA hardware
    fn test_gpu_visits_every_tile_once() {
        let solver = GpuCoulombSolver::new(0).expect("CUDA device");
        let particles = perturbed_lattice(&LatticeConfig::new(10)).unwrap();
        let solution = solver
            .solve_instrumented(&particles, LaunchGeometry::new(2, 128))
            .unwrap();
        let visits = solution.tile_visits.unwrap();
        assert_eq!(visits.len(), tile_count(stripe_count(1000)));
        assert!(visits.iter().all(|&v| v == 1));
    }
}
