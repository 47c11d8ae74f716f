//! Emulated accelerator device.
//!
//! The emulated device owns a device-memory budget and executes kernels over a
//! launch grid of synchronization groups. Each group of [`WARP_SIZE`] lanes runs
//! as a single rayon task, so the lanes of a group are always in lockstep while
//! different groups run concurrently in no particular order.
//!
//! Execution faults behave like a CUDA context: a panic inside a kernel body is
//! recorded as a sticky fault that the next synchronization reports.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info, trace, warn};

use crate::error::{CoulombError, Result};
use crate::warp::{SyncGroup, WARP_SIZE};

/// Default device-memory budget (1 GiB).
pub const DEFAULT_MEMORY_BUDGET: usize = 1 << 30;

/// Maximum lanes per block.
pub const MAX_THREADS_PER_BLOCK: u32 = 1024;

/// Maximum blocks in a one-dimensional grid.
pub const MAX_GRID_BLOCKS: u32 = i32::MAX as u32;

/// 32-bit scalar types that can live in device memory.
///
/// Device cells are `AtomicU32`, so every scalar is stored by bit pattern and
/// supports an atomic add that returns the previous value.
pub trait DeviceScalar:
    bytemuck::Pod + Default + Send + Sync + PartialEq + std::fmt::Debug
{
    /// Bit pattern stored in a device cell.
    #[inline]
    fn into_cell(self) -> u32 {
        bytemuck::cast(self)
    }

    /// Value from a device cell bit pattern.
    #[inline]
    fn from_cell(bits: u32) -> Self {
        bytemuck::cast(bits)
    }

    /// Atomically add `value` to the cell, returning the previous value.
    fn atomic_add(cell: &AtomicU32, value: Self) -> Self;
}

impl DeviceScalar for f32 {
    fn atomic_add(cell: &AtomicU32, value: Self) -> Self {
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(previous) => return f32::from_bits(previous),
                Err(actual) => current = actual,
            }
        }
    }
}

impl DeviceScalar for i32 {
    #[inline]
    fn atomic_add(cell: &AtomicU32, value: Self) -> Self {
        // Two's complement: wrapping u32 addition is i32 addition.
        cell.fetch_add(value as u32, Ordering::AcqRel) as i32
    }
}

impl DeviceScalar for u32 {
    #[inline]
    fn atomic_add(cell: &AtomicU32, value: Self) -> Self {
        cell.fetch_add(value, Ordering::AcqRel)
    }
}

/// Launch grid: `blocks` blocks of `threads_per_block` lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    /// Number of blocks in the grid.
    pub blocks: u32,
    /// Lanes per block (multiple of 32).
    pub threads_per_block: u32,
}

impl Default for LaunchGeometry {
    fn default() -> Self {
        Self {
            blocks: 80,
            threads_per_block: 1024,
        }
    }
}

impl LaunchGeometry {
    /// Create a launch geometry.
    pub fn new(blocks: u32, threads_per_block: u32) -> Self {
        Self {
            blocks,
            threads_per_block,
        }
    }

    /// Reject geometries the device cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.blocks == 0 {
            return Err(CoulombError::LaunchFailed(
                "grid must contain at least one block".to_string(),
            ));
        }
        if self.threads_per_block == 0
            || self.threads_per_block % WARP_SIZE as u32 != 0
            || self.threads_per_block > MAX_THREADS_PER_BLOCK
        {
            return Err(CoulombError::LaunchFailed(format!(
                "threads per block must be a multiple of {} in 1..={}, got {}",
                WARP_SIZE, MAX_THREADS_PER_BLOCK, self.threads_per_block
            )));
        }
        if self.blocks > MAX_GRID_BLOCKS {
            return Err(CoulombError::LaunchFailed(format!(
                "grid of {} blocks exceeds the limit of {}",
                self.blocks, MAX_GRID_BLOCKS
            )));
        }
        // The stripe counter is a signed 32-bit cell primed with `-total_groups`.
        let groups = self.blocks.checked_mul(self.groups_per_block());
        if groups.map_or(true, |groups| groups > i32::MAX as u32) {
            return Err(CoulombError::LaunchFailed(format!(
                "{} x {} grid has more than {} synchronization groups",
                self.blocks,
                self.threads_per_block,
                i32::MAX
            )));
        }
        Ok(())
    }

    /// Synchronization groups per block.
    #[inline]
    pub fn groups_per_block(&self) -> u32 {
        self.threads_per_block / WARP_SIZE as u32
    }

    /// Synchronization groups in the whole grid.
    ///
    /// Saturates for grids that [`validate`](Self::validate) rejects.
    #[inline]
    pub fn total_groups(&self) -> u32 {
        self.blocks.saturating_mul(self.groups_per_block())
    }

    /// Lanes in the whole grid.
    #[inline]
    pub fn total_threads(&self) -> u64 {
        self.blocks as u64 * self.threads_per_block as u64
    }
}

struct DeviceInner {
    name: String,
    memory_budget: usize,
    allocated: AtomicUsize,
    launches: AtomicU64,
    fault: Mutex<Option<String>>,
}

/// Software accelerator executing kernels on the host thread pool.
#[derive(Clone)]
pub struct EmulatedDevice {
    inner: Arc<DeviceInner>,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedDevice {
    /// Create a device with the default memory budget.
    pub fn new() -> Self {
        Self::with_memory_budget(DEFAULT_MEMORY_BUDGET)
    }

    /// Create a device with an explicit memory budget in bytes.
    pub fn with_memory_budget(memory_budget: usize) -> Self {
        info!(
            "Initializing emulated device ({} MiB budget, {} worker threads)",
            memory_budget >> 20,
            rayon::current_num_threads()
        );
        Self {
            inner: Arc::new(DeviceInner {
                name: "emulated".to_string(),
                memory_budget,
                allocated: AtomicUsize::new(0),
                launches: AtomicU64::new(0),
                fault: Mutex::new(None),
            }),
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Total device memory in bytes.
    pub fn memory_budget(&self) -> usize {
        self.inner.memory_budget
    }

    /// Bytes currently allocated.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn available(&self) -> usize {
        self.memory_budget().saturating_sub(self.allocated())
    }

    /// Number of kernels launched so far.
    pub fn launch_count(&self) -> u64 {
        self.inner.launches.load(Ordering::Relaxed)
    }

    /// Allocate a zero-initialized device array of `len` elements.
    pub fn alloc<T: DeviceScalar>(&self, len: usize) -> Result<DeviceSlice<T>> {
        let budget = self.inner.memory_budget;
        let bytes = len
            .checked_mul(std::mem::size_of::<u32>())
            .ok_or_else(|| CoulombError::AllocationFailed {
                requested: usize::MAX,
                available: self.available(),
            })?;

        self.inner
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= budget)
            })
            .map_err(|used| CoulombError::AllocationFailed {
                requested: bytes,
                available: budget.saturating_sub(used),
            })?;

        let mut cells = Vec::new();
        if cells.try_reserve_exact(len).is_err() {
            self.release(bytes);
            return Err(CoulombError::AllocationFailed {
                requested: bytes,
                available: self.available(),
            });
        }
        cells.extend((0..len).map(|_| AtomicU32::new(0)));

        trace!(len = len, bytes = bytes, "Device allocation");

        Ok(DeviceSlice {
            cells: cells.into_boxed_slice(),
            device: self.clone(),
            _marker: PhantomData,
        })
    }

    fn release(&self, bytes: usize) {
        self.inner.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Launch `kernel` once per synchronization group of `geometry`.
    ///
    /// Returns once every group has finished. Invalid geometry or a pending
    /// fault fail the launch; a panic inside the kernel is recorded as a fault
    /// and reported by the next [`synchronize`](Self::synchronize).
    pub fn launch<F>(&self, name: &str, geometry: LaunchGeometry, kernel: F) -> Result<()>
    where
        F: Fn(&SyncGroup) + Sync,
    {
        geometry.validate()?;

        if let Some(fault) = self.inner.fault.lock().as_ref() {
            return Err(CoulombError::LaunchFailed(format!(
                "kernel '{}' launched on faulted device: {}",
                name, fault
            )));
        }

        debug!(
            "Launching kernel '{}' (grid={}, block={}, groups={})",
            name,
            geometry.blocks,
            geometry.threads_per_block,
            geometry.total_groups()
        );

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (0..geometry.total_groups())
                .into_par_iter()
                .for_each(|index| kernel(&SyncGroup::new(geometry, index)));
        }));

        self.inner.launches.fetch_add(1, Ordering::Relaxed);

        if let Err(payload) = outcome {
            let reason = panic_message(payload.as_ref());
            warn!("Kernel '{}' faulted: {}", name, reason);
            *self.inner.fault.lock() = Some(format!("kernel '{}': {}", name, reason));
        }

        Ok(())
    }

    /// Wait for outstanding work and report any execution fault.
    pub fn synchronize(&self) -> Result<()> {
        match self.inner.fault.lock().as_ref() {
            Some(fault) => Err(CoulombError::SyncFailed(fault.clone())),
            None => Ok(()),
        }
    }

    /// Whether an execution fault is pending.
    pub fn is_faulted(&self) -> bool {
        self.inner.fault.lock().is_some()
    }

    pub(crate) fn check_transfer(&self, direction: &str) -> Result<()> {
        match self.inner.fault.lock().as_ref() {
            Some(fault) => Err(CoulombError::TransferFailed(format!(
                "{} copy on faulted device: {}",
                direction, fault
            ))),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("name", &self.inner.name)
            .field("memory_budget", &self.inner.memory_budget)
            .field("allocated", &self.allocated())
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Array resident in emulated device memory.
///
/// Cells are shared between all concurrently running groups; kernels mutate
/// them only through [`store`](Self::store) on cells they own exclusively or
/// through [`atomic_add`](Self::atomic_add).
pub struct DeviceSlice<T: DeviceScalar> {
    cells: Box<[AtomicU32]>,
    device: EmulatedDevice,
    _marker: PhantomData<T>,
}

impl<T: DeviceScalar> DeviceSlice<T> {
    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.cells.len() * std::mem::size_of::<u32>()
    }

    /// Owning device.
    pub fn device(&self) -> &EmulatedDevice {
        &self.device
    }

    /// Read element `index`.
    #[inline]
    pub fn load(&self, index: usize) -> T {
        T::from_cell(self.cells[index].load(Ordering::Acquire))
    }

    /// Overwrite element `index`.
    #[inline]
    pub fn store(&self, index: usize, value: T) {
        self.cells[index].store(value.into_cell(), Ordering::Release);
    }

    /// Atomically add to element `index`, returning the previous value.
    #[inline]
    pub fn atomic_add(&self, index: usize, value: T) -> T {
        T::atomic_add(&self.cells[index], value)
    }

    /// Copy `src` into the first `src.len()` elements.
    pub fn copy_from_host(&self, src: &[T]) -> Result<()> {
        if src.len() > self.len() {
            return Err(CoulombError::TransferFailed(format!(
                "HtoD copy of {} elements into {}-element device array",
                src.len(),
                self.len()
            )));
        }
        for (cell, value) in self.cells.iter().zip(src) {
            cell.store(value.into_cell(), Ordering::Release);
        }
        Ok(())
    }

    /// Copy the first `dst.len()` elements into `dst`.
    pub fn copy_to_host(&self, dst: &mut [T]) -> Result<()> {
        if dst.len() > self.len() {
            return Err(CoulombError::TransferFailed(format!(
                "DtoH copy of {} elements from {}-element device array",
                dst.len(),
                self.len()
            )));
        }
        for (value, cell) in dst.iter_mut().zip(self.cells.iter()) {
            *value = T::from_cell(cell.load(Ordering::Acquire));
        }
        Ok(())
    }

    /// Snapshot of the whole array.
    pub fn to_vec(&self) -> Vec<T> {
        self.cells
            .iter()
            .map(|cell| T::from_cell(cell.load(Ordering::Acquire)))
            .collect()
    }
}

impl<T: DeviceScalar> Drop for DeviceSlice<T> {
    fn drop(&mut self) {
        self.device.release(self.size_bytes());
    }
}

impl<T: DeviceScalar> std::fmt::Debug for DeviceSlice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSlice")
            .field("len", &self.len())
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_counts() {
        let geometry = LaunchGeometry::default();
        assert_eq!(geometry.groups_per_block(), 32);
        assert_eq!(geometry.total_groups(), 80 * 32);
        assert_eq!(geometry.total_threads(), 80 * 1024);
        assert!(geometry.validate().is_ok());
    }

    #[test]
    fn test_geometry_validation() {
        assert!(LaunchGeometry::new(0, 64).validate().is_err());
        assert!(LaunchGeometry::new(4, 48).validate().is_err());
        assert!(LaunchGeometry::new(4, 2048).validate().is_err());
        assert!(LaunchGeometry::new(1, 32).validate().is_ok());

        assert!(LaunchGeometry::new(MAX_GRID_BLOCKS, 32).validate().is_ok());
        for geometry in [
            LaunchGeometry::new(u32::MAX, 1024),
            LaunchGeometry::new(MAX_GRID_BLOCKS, 64),
            LaunchGeometry::new(1 << 27, 1024),
        ] {
            assert!(
                matches!(geometry.validate(), Err(CoulombError::LaunchFailed(_))),
                "{:?}",
                geometry
            );
        }
        assert_eq!(LaunchGeometry::new(u32::MAX, 1024).total_groups(), u32::MAX);
    }

    #[test]
    fn test_scalar_cells() {
        assert_eq!(f32::from_cell(1.5f32.into_cell()), 1.5);
        assert_eq!(i32::from_cell((-7i32).into_cell()), -7);

        let cell = AtomicU32::new(5i32.into_cell());
        assert_eq!(i32::atomic_add(&cell, -8), 5);
        assert_eq!(i32::from_cell(cell.load(Ordering::Relaxed)), -3);

        let cell = AtomicU32::new(0.25f32.into_cell());
        assert_eq!(f32::atomic_add(&cell, 0.5), 0.25);
        assert_eq!(f32::from_cell(cell.load(Ordering::Relaxed)), 0.75);
    }

    #[test]
    fn test_alloc_accounting() {
        let device = EmulatedDevice::with_memory_budget(1024);
        let a = device.alloc::<f32>(128).unwrap();
        assert_eq!(device.allocated(), 512);
        assert!(a.to_vec().iter().all(|&v| v == 0.0));

        let err = device.alloc::<f32>(256).unwrap_err();
        assert!(matches!(
            err,
            CoulombError::AllocationFailed {
                requested: 1024,
                available: 512
            }
        ));

        drop(a);
        assert_eq!(device.allocated(), 0);
        assert!(device.alloc::<f32>(256).is_ok());

        assert!(matches!(
            device.alloc::<f32>(usize::MAX),
            Err(CoulombError::AllocationFailed { requested: usize::MAX, .. })
        ));
    }

    #[test]
    fn test_unsatisfiable_alloc_keeps_budget() {
        let device = EmulatedDevice::with_memory_budget(usize::MAX);
        let result = device.alloc::<f32>(usize::MAX / 8);
        assert!(matches!(result, Err(CoulombError::AllocationFailed { .. })));
        assert_eq!(device.allocated(), 0);
    }

    #[test]
    fn test_concurrent_atomic_add() {
        let device = EmulatedDevice::new();
        let slice = device.alloc::<f32>(1).unwrap();
        device
            .launch("add", LaunchGeometry::new(8, 256), |_group| {
                slice.atomic_add(0, 1.0);
            })
            .unwrap();
        device.synchronize().unwrap();
        assert_eq!(slice.load(0), 64.0);
        assert_eq!(device.launch_count(), 1);
    }

    #[test]
    fn test_kernel_fault_is_sticky() {
        let device = EmulatedDevice::new();
        device
            .launch("boom", LaunchGeometry::new(1, 32), |_group| {
                panic!("lane fault");
            })
            .unwrap();

        assert!(device.is_faulted());
        let err = device.synchronize().unwrap_err();
        assert!(matches!(err, CoulombError::SyncFailed(ref msg) if msg.contains("lane fault")));
        assert!(device.synchronize().is_err());
        assert!(matches!(
            device.launch("next", LaunchGeometry::new(1, 32), |_| {}),
            Err(CoulombError::LaunchFailed(_))
        ));
        assert!(matches!(
            device.check_transfer("HtoD"),
            Err(CoulombError::TransferFailed(_))
        ));
    }

    #[test]
    fn test_invalid_launch_rejected() {
        let device = EmulatedDevice::new();
        let result = device.launch("bad", LaunchGeometry::new(1, 33), |_| {});
        assert!(matches!(result, Err(CoulombError::LaunchFailed(_))));
        let result = device.launch("huge", LaunchGeometry::new(u32::MAX, 1024), |_| {});
        assert!(matches!(result, Err(CoulombError::LaunchFailed(_))));
        assert_eq!(device.launch_count(), 0);
    }

    #[test]
    fn test_host_copies() {
        let device = EmulatedDevice::new();
        let slice = device.alloc::<i32>(4).unwrap();
        slice.copy_from_host(&[1, 2, 3]).unwrap();
        let mut out = [0i32; 4];
        slice.copy_to_host(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 0]);
        assert!(slice.copy_from_host(&[0; 5]).is_err());
    }
}
