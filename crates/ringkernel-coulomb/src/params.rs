//! Kernel parameter package and the buffers it is staged from.
//!
//! [`ConstantsPackage`] is the immutable record every kernel launch receives by
//! value. It borrows the device arrays it points into, so it cannot outlive
//! them and cannot be rebuilt while they are being reallocated.

use tracing::debug;

use crate::buffer::{HostMemory, MirroredBuffer};
use crate::device::{DeviceSlice, EmulatedDevice};
use crate::error::{CoulombError, Result};
use crate::lattice::ParticleSet;
use crate::queue::{stripe_count, tile_count, StripeQueue};
use crate::reference::ForceField;
use crate::warp::WARP_SIZE;

/// Minimum clearance between padding lanes and the nearest real particle.
pub const PADDING_MARGIN: f32 = 1.0e5;

/// Distance from the origin along y at which padding lanes are placed.
///
/// With every real coordinate inside `[-extent, extent]`, row-side padding
/// goes to `y = +offset` and column-side padding to `y = -offset`, where
/// `offset = extent + max(extent, PADDING_MARGIN)`. Non-finite coordinates
/// are rejected.
pub fn padding_offset(coordinates: impl IntoIterator<Item = f32>) -> Result<f32> {
    let mut extent = 0.0f32;
    for (i, value) in coordinates.into_iter().enumerate() {
        if !value.is_finite() {
            return Err(CoulombError::InvalidConfig(format!(
                "coordinate {} is not finite ({})",
                i, value
            )));
        }
        extent = extent.max(value.abs());
    }
    let offset = extent + extent.max(PADDING_MARGIN);
    if !offset.is_finite() {
        return Err(CoulombError::InvalidConfig(format!(
            "coordinate extent {} leaves no room for padding",
            extent
        )));
    }
    Ok(offset)
}

/// Read-only launch parameters shared by the force kernels.
#[derive(Clone, Copy)]
pub struct ConstantsPackage<'a> {
    n: usize,
    x: &'a DeviceSlice<f32>,
    y: &'a DeviceSlice<f32>,
    z: &'a DeviceSlice<f32>,
    q: &'a DeviceSlice<f32>,
    fx: &'a DeviceSlice<f32>,
    fy: &'a DeviceSlice<f32>,
    fz: &'a DeviceSlice<f32>,
    tile_counter: &'a DeviceSlice<i32>,
    energy: &'a DeviceSlice<f32>,
    tile_visits: Option<&'a DeviceSlice<u32>>,
    padding_offset: f32,
}

impl<'a> ConstantsPackage<'a> {
    /// Assemble a package for `n` particles.
    ///
    /// Every particle array must hold at least `32 * stripe_count(n)` elements
    /// so that padding lanes of the last stripe stay in bounds. Positions must
    /// already be on the device: the padding offset is derived from them.
    pub fn new(
        n: usize,
        positions: [&'a DeviceSlice<f32>; 3],
        charges: &'a DeviceSlice<f32>,
        forces: [&'a DeviceSlice<f32>; 3],
        tile_counter: &'a DeviceSlice<i32>,
        energy: &'a DeviceSlice<f32>,
    ) -> Result<Self> {
        if n == 0 {
            return Err(CoulombError::InvalidConfig(
                "particle count must be positive".to_string(),
            ));
        }
        if stripe_count(n) > i32::MAX as usize {
            return Err(CoulombError::InvalidConfig(format!(
                "{} particles exceed the 32-bit stripe counter",
                n
            )));
        }

        let required = stripe_count(n) * WARP_SIZE;
        let arrays = positions
            .iter()
            .chain(std::iter::once(&charges))
            .chain(forces.iter());
        for (name, slice) in ["x", "y", "z", "q", "fx", "fy", "fz"].iter().zip(arrays) {
            if slice.len() < required {
                return Err(CoulombError::InvalidConfig(format!(
                    "array '{}' holds {} elements, {} required for {} particles",
                    name,
                    slice.len(),
                    required,
                    n
                )));
            }
        }
        if tile_counter.is_empty() || energy.is_empty() {
            return Err(CoulombError::InvalidConfig(
                "tile counter and energy accumulator need one cell each".to_string(),
            ));
        }

        let coordinates = positions
            .iter()
            .flat_map(|axis| (0..n).map(move |i| axis.load(i)));
        let padding_offset = padding_offset(coordinates)?;

        debug!(
            n = n,
            stripes = stripe_count(n),
            padding_offset = padding_offset,
            "Staged constants package"
        );

        Ok(Self {
            n,
            x: positions[0],
            y: positions[1],
            z: positions[2],
            q: charges,
            fx: forces[0],
            fy: forces[1],
            fz: forces[2],
            tile_counter,
            energy,
            tile_visits: None,
            padding_offset,
        })
    }

    /// Attach a per-tile visit counter array.
    pub fn with_tile_visits(mut self, visits: &'a DeviceSlice<u32>) -> Result<Self> {
        let required = tile_count(stripe_count(self.n));
        if visits.len() < required {
            return Err(CoulombError::InvalidConfig(format!(
                "tile visit array holds {} elements, {} tiles required",
                visits.len(),
                required
            )));
        }
        self.tile_visits = Some(visits);
        Ok(self)
    }

    /// Particle count.
    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of 32-particle stripes.
    #[inline]
    pub fn stripes(&self) -> usize {
        stripe_count(self.n)
    }

    /// Position arrays.
    #[inline]
    pub fn positions(&self) -> [&'a DeviceSlice<f32>; 3] {
        [self.x, self.y, self.z]
    }

    /// Charge array.
    #[inline]
    pub fn charges(&self) -> &'a DeviceSlice<f32> {
        self.q
    }

    /// Force accumulator arrays.
    #[inline]
    pub fn forces(&self) -> [&'a DeviceSlice<f32>; 3] {
        [self.fx, self.fy, self.fz]
    }

    /// Work queue over the shared tile counter.
    #[inline]
    pub fn queue(&self) -> StripeQueue<'a> {
        StripeQueue::new(self.tile_counter)
    }

    /// Energy accumulator cell.
    #[inline]
    pub fn energy(&self) -> &'a DeviceSlice<f32> {
        self.energy
    }

    /// Instrumented tile-visit counters, if attached.
    #[inline]
    pub fn tile_visits(&self) -> Option<&'a DeviceSlice<u32>> {
        self.tile_visits
    }

    /// Distance of padding lanes from the origin along y.
    #[inline]
    pub fn padding_offset(&self) -> f32 {
        self.padding_offset
    }
}

impl std::fmt::Debug for ConstantsPackage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstantsPackage")
            .field("n", &self.n)
            .field("stripes", &self.stripes())
            .field("tile_visits", &self.tile_visits.is_some())
            .field("padding_offset", &self.padding_offset)
            .finish()
    }
}

/// Mirrored particle, force, counter and energy buffers for one system.
pub struct ParticleBuffers {
    n: usize,
    x: MirroredBuffer<f32>,
    y: MirroredBuffer<f32>,
    z: MirroredBuffer<f32>,
    q: MirroredBuffer<f32>,
    fx: MirroredBuffer<f32>,
    fy: MirroredBuffer<f32>,
    fz: MirroredBuffer<f32>,
    tile_counter: MirroredBuffer<i32>,
    energy: MirroredBuffer<f32>,
    tile_visits: Option<MirroredBuffer<u32>>,
}

impl ParticleBuffers {
    /// Allocate buffers for `n` particles on `device`.
    pub fn new(device: &EmulatedDevice, n: usize, mode: HostMemory) -> Result<Self> {
        let buffers = Self {
            n,
            x: MirroredBuffer::new(device, n, mode)?,
            y: MirroredBuffer::new(device, n, mode)?,
            z: MirroredBuffer::new(device, n, mode)?,
            q: MirroredBuffer::new(device, n, mode)?,
            fx: MirroredBuffer::new(device, n, mode)?,
            fy: MirroredBuffer::new(device, n, mode)?,
            fz: MirroredBuffer::new(device, n, mode)?,
            tile_counter: MirroredBuffer::new(device, 1, mode)?,
            energy: MirroredBuffer::new(device, 1, mode)?,
            tile_visits: None,
        };
        debug!(
            "Allocated particle buffers for {} particles ({} bytes on device)",
            n,
            device.allocated()
        );
        Ok(buffers)
    }

    /// Also allocate a tile-visit counter array for instrumented runs.
    pub fn with_tile_visits(mut self, device: &EmulatedDevice) -> Result<Self> {
        let tiles = tile_count(stripe_count(self.n));
        self.tile_visits = Some(MirroredBuffer::new(device, tiles, self.x.mode())?);
        Ok(self)
    }

    /// Particle count.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Copy a particle set into the host arrays and clear host forces.
    pub fn load(&mut self, particles: &ParticleSet) -> Result<()> {
        if particles.len() != self.n {
            return Err(CoulombError::InvalidConfig(format!(
                "particle set has {} particles, buffers hold {}",
                particles.len(),
                self.n
            )));
        }
        self.x.host_mut().copy_from_slice(&particles.x);
        self.y.host_mut().copy_from_slice(&particles.y);
        self.z.host_mut().copy_from_slice(&particles.z);
        self.q.host_mut().copy_from_slice(&particles.q);
        for force in [&mut self.fx, &mut self.fy, &mut self.fz] {
            force.host_mut().fill(0.0);
        }
        Ok(())
    }

    /// Upload positions and charges. Force buffers are initialized on the device.
    pub fn upload_inputs(&self) -> Result<()> {
        for buffer in [&self.x, &self.y, &self.z, &self.q] {
            buffer.upload()?;
        }
        Ok(())
    }

    /// Download forces, energy and, if present, tile-visit counters.
    pub fn download_results(&mut self) -> Result<()> {
        for buffer in [&mut self.fx, &mut self.fy, &mut self.fz, &mut self.energy] {
            buffer.download()?;
        }
        if let Some(visits) = self.tile_visits.as_mut() {
            visits.download()?;
        }
        Ok(())
    }

    /// Build the launch parameters over the device arrays.
    pub fn constants(&self) -> Result<ConstantsPackage<'_>> {
        let package = ConstantsPackage::new(
            self.n,
            [
                self.x.device_slice(),
                self.y.device_slice(),
                self.z.device_slice(),
            ],
            self.q.device_slice(),
            [
                self.fx.device_slice(),
                self.fy.device_slice(),
                self.fz.device_slice(),
            ],
            self.tile_counter.device_slice(),
            self.energy.device_slice(),
        )?;
        match &self.tile_visits {
            Some(visits) => package.with_tile_visits(visits.device_slice()),
            None => Ok(package),
        }
    }

    /// Host copy of the last downloaded results.
    pub fn results(&self) -> ForceField {
        ForceField {
            energy: f64::from(self.energy.host()[0]),
            fx: self.fx.host().to_vec(),
            fy: self.fy.host().to_vec(),
            fz: self.fz.host().to_vec(),
        }
    }

    /// Host copy of the last downloaded tile-visit counters.
    pub fn tile_visits(&self) -> Option<&[u32]> {
        self.tile_visits.as_ref().map(|visits| visits.host())
    }
}

impl std::fmt::Debug for ParticleBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticleBuffers")
            .field("n", &self.n)
            .field("capacity", &self.x.capacity())
            .field("mode", &self.x.mode())
            .field("tile_visits", &self.tile_visits.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_validation() {
        let device = EmulatedDevice::new();
        let full = device.alloc::<f32>(64).unwrap();
        let short = device.alloc::<f32>(32).unwrap();
        let counter = device.alloc::<i32>(1).unwrap();
        let energy = device.alloc::<f32>(1).unwrap();

        let ok = ConstantsPackage::new(
            40,
            [&full, &full, &full],
            &full,
            [&full, &full, &full],
            &counter,
            &energy,
        )
        .unwrap();
        assert_eq!(ok.stripes(), 2);

        let err = ConstantsPackage::new(
            40,
            [&full, &full, &full],
            &full,
            [&full, &short, &full],
            &counter,
            &energy,
        )
        .unwrap_err();
        assert!(matches!(err, CoulombError::InvalidConfig(ref msg) if msg.contains("fy")));

        let visits = device.alloc::<u32>(2).unwrap();
        assert!(ok.with_tile_visits(&visits).is_err());
        let visits = device.alloc::<u32>(3).unwrap();
        assert!(ok.with_tile_visits(&visits).unwrap().tile_visits().is_some());
    }

    #[test]
    fn test_padding_offset_clears_particles() {
        assert_eq!(padding_offset([0.0, 1.0, -2.0]).unwrap(), 2.0 + PADDING_MARGIN);
        assert_eq!(padding_offset(std::iter::empty()).unwrap(), PADDING_MARGIN);

        // A particle on the old fixed padding line pushes padding further out.
        let offset = padding_offset([5.0, 1.0e5, 0.0]).unwrap();
        assert!(offset - 1.0e5 >= 1.0e5);

        let far = padding_offset([-3.0e20]).unwrap();
        assert_eq!(far, 6.0e20);

        assert!(matches!(
            padding_offset([0.0, f32::NAN]),
            Err(CoulombError::InvalidConfig(_))
        ));
        assert!(padding_offset([f32::INFINITY]).is_err());
        assert!(padding_offset([f32::MAX]).is_err());
    }

    #[test]
    fn test_package_padding_follows_positions() {
        let device = EmulatedDevice::new();
        let x = device.alloc::<f32>(64).unwrap();
        let y = device.alloc::<f32>(64).unwrap();
        let zero = device.alloc::<f32>(64).unwrap();
        let counter = device.alloc::<i32>(1).unwrap();
        let energy = device.alloc::<f32>(1).unwrap();
        x.store(0, 5.0);
        y.store(3, -2.5e5);
        // Past `n`: ignored.
        y.store(40, 9.0e9);

        let package = ConstantsPackage::new(
            33,
            [&x, &y, &zero],
            &zero,
            [&zero, &zero, &zero],
            &counter,
            &energy,
        )
        .unwrap();
        assert_eq!(package.padding_offset(), 5.0e5);

        y.store(7, f32::NAN);
        let err = ConstantsPackage::new(
            33,
            [&x, &y, &zero],
            &zero,
            [&zero, &zero, &zero],
            &counter,
            &energy,
        )
        .unwrap_err();
        assert!(matches!(err, CoulombError::InvalidConfig(_)));
    }

    #[test]
    fn test_buffers_load_and_stage() {
        let device = EmulatedDevice::new();
        let mut buffers = ParticleBuffers::new(&device, 3, HostMemory::Pageable).unwrap();
        let particles = ParticleSet::from_vecs(
            vec![0.0, 1.0, 2.0],
            vec![0.0; 3],
            vec![0.0; 3],
            vec![1.0, 0.5, 0.25],
        )
        .unwrap();
        buffers.load(&particles).unwrap();
        buffers.upload_inputs().unwrap();

        let package = buffers.constants().unwrap();
        assert_eq!(package.n(), 3);
        assert_eq!(package.positions()[0].load(2), 2.0);
        assert_eq!(package.charges().load(1), 0.5);
        assert!(package.tile_visits().is_none());

        let wrong = ParticleSet::from_vecs(vec![0.0], vec![0.0], vec![0.0], vec![1.0]).unwrap();
        assert!(buffers.load(&wrong).is_err());
    }

    #[test]
    fn test_buffers_release_on_drop() {
        let device = EmulatedDevice::new();
        {
            let _buffers = ParticleBuffers::new(&device, 100, HostMemory::Pinned)
                .unwrap()
                .with_tile_visits(&device)
                .unwrap();
            assert!(device.allocated() > 0);
        }
        assert_eq!(device.allocated(), 0);
    }
}
