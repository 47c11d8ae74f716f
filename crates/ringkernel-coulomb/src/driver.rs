//! End-to-end run: lattice, reference solve, accelerator solve, report.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::buffer::HostMemory;
use crate::device::{EmulatedDevice, LaunchGeometry, DEFAULT_MEMORY_BUDGET};
use crate::error::{CoulombError, Result};
use crate::kernels;
use crate::lattice::{perturbed_lattice, LatticeConfig, ParticleSet};
use crate::params::ParticleBuffers;
use crate::reference::{self, ForceField};
use crate::validate::{compare, Comparison, Tolerances};

/// Accelerator backend used for the force evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Emulated accelerator on the host thread pool.
    #[default]
    Cpu,
    /// CUDA device (requires the `cuda` feature).
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::Cuda => write!(f, "cuda"),
        }
    }
}

/// Run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Particle lattice.
    pub lattice: LatticeConfig,
    /// Launch grid shared by both kernels.
    pub geometry: LaunchGeometry,
    /// Host storage of the mirrored buffers.
    pub host_memory: HostMemory,
    /// Accelerator backend.
    pub backend: Backend,
    /// Index stride of the sampled forces in the report.
    pub sample_stride: usize,
    /// Device memory budget of the emulated accelerator, in bytes.
    pub memory_budget: usize,
    /// CUDA device ordinal.
    pub device_ordinal: usize,
    /// Acceptance thresholds.
    pub tolerances: Tolerances,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lattice: LatticeConfig::default(),
            geometry: LaunchGeometry::default(),
            host_memory: HostMemory::Pinned,
            backend: Backend::Cpu,
            sample_stride: 512,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            device_ordinal: 0,
            tolerances: Tolerances::default(),
        }
    }
}

impl RunConfig {
    /// Create a configuration for a `dim^3` lattice.
    pub fn new(dim: usize) -> Self {
        Self {
            lattice: LatticeConfig::new(dim),
            ..Self::default()
        }
    }

    /// Set the lattice configuration.
    pub fn with_lattice(mut self, lattice: LatticeConfig) -> Self {
        self.lattice = lattice;
        self
    }

    /// Set the launch geometry.
    pub fn with_geometry(mut self, geometry: LaunchGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Set the host memory mode.
    pub fn with_host_memory(mut self, host_memory: HostMemory) -> Self {
        self.host_memory = host_memory;
        self
    }

    /// Set the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the sampled force stride.
    pub fn with_sample_stride(mut self, sample_stride: usize) -> Self {
        self.sample_stride = sample_stride;
        self
    }

    /// Set the emulated device memory budget.
    pub fn with_memory_budget(mut self, memory_budget: usize) -> Self {
        self.memory_budget = memory_budget;
        self
    }

    /// Set the acceptance thresholds.
    pub fn with_tolerances(mut self, tolerances: Tolerances) -> Self {
        self.tolerances = tolerances;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.sample_stride == 0 {
            return Err(CoulombError::InvalidConfig(
                "sample stride must be positive".to_string(),
            ));
        }
        self.geometry.validate()
    }
}

/// Wall-clock time per run phase.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseTimings {
    /// Lattice generation, device and buffer setup.
    pub setup: Duration,
    /// Sequential reference solve.
    pub sequential: Duration,
    /// Accelerator solve including transfers.
    pub accelerator: Duration,
}

/// Outcome of [`run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Backend that produced `computed`.
    pub backend: Backend,
    /// Particle count.
    pub particles: usize,
    /// Sampled force stride.
    pub sample_stride: usize,
    /// Sequential reference result.
    pub reference: ForceField,
    /// Accelerator result.
    pub computed: ForceField,
    /// Deviation of `computed` from `reference`.
    pub comparison: Comparison,
    /// Whether `comparison` is within the configured tolerances.
    pub passed: bool,
    /// Phase timings.
    pub timings: PhaseTimings,
}

impl RunReport {
    fn write_samples(&self, f: &mut fmt::Formatter<'_>, field: &ForceField) -> fmt::Result {
        for i in (0..field.len()).step_by(self.sample_stride) {
            let [fx, fy, fz] = field.force(i);
            writeln!(f, "  f[{:>6}] = ({:>14.6e}, {:>14.6e}, {:>14.6e})", i, fx, fy, fz)?;
        }
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sequential energy:  {:.8e}", self.reference.energy)?;
        writeln!(f, "Sequential forces:")?;
        self.write_samples(f, &self.reference)?;
        writeln!(f, "Accelerator energy: {:.8e} ({})", self.computed.energy, self.backend)?;
        writeln!(f, "Accelerator forces:")?;
        self.write_samples(f, &self.computed)?;
        writeln!(
            f,
            "Validation:         {} ({})",
            if self.passed { "PASS" } else { "FAIL" },
            self.comparison
        )?;
        writeln!(
            f,
            "Setup time:         {:.3} ms",
            self.timings.setup.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "Sequential solve:   {:.3} ms",
            self.timings.sequential.as_secs_f64() * 1000.0
        )?;
        write!(
            f,
            "Accelerator solve:  {:.3} ms (including transfers)",
            self.timings.accelerator.as_secs_f64() * 1000.0
        )
    }
}

/// Solve `particles` on an emulated device with freshly staged buffers.
pub fn solve_emulated(
    device: &EmulatedDevice,
    particles: &ParticleSet,
    geometry: LaunchGeometry,
    host_memory: HostMemory,
) -> Result<ForceField> {
    let mut buffers = ParticleBuffers::new(device, particles.len(), host_memory)?;
    buffers.load(particles)?;
    solve_staged(device, &mut buffers, geometry)
}

/// Upload, evaluate and download on already loaded buffers.
pub fn solve_staged(
    device: &EmulatedDevice,
    buffers: &mut ParticleBuffers,
    geometry: LaunchGeometry,
) -> Result<ForceField> {
    buffers.upload_inputs()?;
    kernels::evaluate(device, geometry, buffers.constants()?)?;
    buffers.download_results()?;
    Ok(buffers.results())
}

/// Run the full pipeline without progress output.
pub fn run(config: &RunConfig) -> Result<RunReport> {
    run_with_progress(config, |_, _| {})
}

/// Run the full pipeline.
///
/// `progress(done, total)` is forwarded from the sequential solver.
pub fn run_with_progress(
    config: &RunConfig,
    progress: impl FnMut(usize, usize),
) -> Result<RunReport> {
    config.validate()?;

    let setup_start = Instant::now();
    let particles = perturbed_lattice(&config.lattice)?;
    let n = particles.len();
    info!(
        "Generated {} particles ({}^3 lattice, seed {})",
        n, config.lattice.dim, config.lattice.seed
    );
    let mut accelerator = Accelerator::prepare(config, &particles)?;
    let setup = setup_start.elapsed();

    let sequential_start = Instant::now();
    let reference = reference::solve_with_progress(&particles, progress);
    let sequential = sequential_start.elapsed();
    info!("Sequential energy: {:.8e}", reference.energy);

    let accelerator_start = Instant::now();
    let computed = accelerator.solve(config, &particles)?;
    let accelerator_time = accelerator_start.elapsed();
    info!("Accelerator energy: {:.8e}", computed.energy);

    let comparison = compare(&reference, &computed);
    let passed = comparison.passes(&config.tolerances);
    if passed {
        info!("Validation passed: {}", comparison);
    } else {
        warn!("Validation failed: {}", comparison);
    }

    Ok(RunReport {
        backend: config.backend,
        particles: n,
        sample_stride: config.sample_stride,
        reference,
        computed,
        comparison,
        passed,
        timings: PhaseTimings {
            setup,
            sequential,
            accelerator: accelerator_time,
        },
    })
}

enum Accelerator {
    Emulated {
        device: EmulatedDevice,
        buffers: ParticleBuffers,
    },
    #[cfg(feature = "cuda")]
    Cuda(crate::gpu::GpuCoulombSolver),
}

impl Accelerator {
    fn prepare(config: &RunConfig, particles: &ParticleSet) -> Result<Self> {
        match config.backend {
            Backend::Cpu => {
                let device = EmulatedDevice::with_memory_budget(config.memory_budget);
                let mut buffers =
                    ParticleBuffers::new(&device, particles.len(), config.host_memory)?;
                buffers.load(particles)?;
                Ok(Accelerator::Emulated { device, buffers })
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda => Ok(Accelerator::Cuda(crate::gpu::GpuCoulombSolver::new(
                config.device_ordinal,
            )?)),
            #[cfg(not(feature = "cuda"))]
            Backend::Cuda => Err(CoulombError::BackendUnavailable(
                "built without the `cuda` feature".to_string(),
            )),
        }
    }

    #[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
    fn solve(&mut self, config: &RunConfig, particles: &ParticleSet) -> Result<ForceField> {
        match self {
            Accelerator::Emulated { device, buffers } => {
                solve_staged(device, buffers, config.geometry)
            }
            #[cfg(feature = "cuda")]
            Accelerator::Cuda(solver) => solver.solve(particles, config.geometry),
        }
    }
}
