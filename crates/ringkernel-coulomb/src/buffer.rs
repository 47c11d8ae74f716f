//! Host/device mirrored buffers.
//!
//! A [`MirroredBuffer`] owns a host array and a device array of the same padded
//! capacity and copies between them only when asked. Both sides are released
//! when the buffer is dropped, on every exit path.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::device::{DeviceScalar, DeviceSlice, EmulatedDevice};
use crate::error::{CoulombError, Result};

/// Device-side allocations are rounded up to this many elements.
pub const DEVICE_ALIGNMENT: usize = 128;

/// Alignment of pinned host allocations.
pub const PAGE_SIZE: usize = 4096;

/// Round `len` up to the device allocation granularity.
///
/// Returns `None` if the padded length does not fit in `usize`.
#[inline]
pub fn padded_len(len: usize) -> Option<usize> {
    len.div_ceil(DEVICE_ALIGNMENT).checked_mul(DEVICE_ALIGNMENT)
}

/// Byte size of `count` elements of `T`, saturated at `usize::MAX`.
#[inline]
pub(crate) fn byte_size<T>(count: usize) -> usize {
    count.saturating_mul(std::mem::size_of::<T>())
}

/// Allocate `count` default-initialized elements on the heap.
///
/// Allocation failure is reported as [`CoulombError::HostAllocationFailed`]
/// instead of aborting.
pub(crate) fn host_vec<T: Clone + Default>(count: usize) -> Result<Vec<T>> {
    let mut vec = Vec::new();
    vec.try_reserve_exact(count)
        .map_err(|_| CoulombError::HostAllocationFailed {
            requested: byte_size::<T>(count),
        })?;
    vec.resize(count, T::default());
    Ok(vec)
}

/// Host storage mode of a mirrored buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostMemory {
    /// Page-locked, page-aligned storage for faster transfers.
    #[default]
    Pinned,
    /// Ordinary pageable heap storage.
    Pageable,
}

/// Pinned (page-locked) host memory for efficient DMA transfers.
///
/// Allocated page-aligned and zeroed; `T: Pod` makes the zero pattern a valid
/// value.
pub struct PinnedMemory<T: bytemuck::Pod> {
    ptr: NonNull<T>,
    len: usize,
    layout: Layout,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod> PinnedMemory<T> {
    /// Allocate zeroed pinned memory for `count` elements.
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(CoulombError::InvalidConfig(
                "Cannot allocate zero-sized buffer".to_string(),
            ));
        }

        let size = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(CoulombError::HostAllocationFailed {
                requested: usize::MAX,
            })?;
        let layout = Layout::from_size_align(size, PAGE_SIZE.max(std::mem::align_of::<T>()))
            .map_err(|_| CoulombError::HostAllocationFailed { requested: size })?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw as *mut T)
            .ok_or(CoulombError::HostAllocationFailed { requested: size })?;

        Ok(Self {
            ptr,
            len: count,
            layout,
            _marker: PhantomData,
        })
    }

    /// Get slice reference.
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: ptr is valid for len initialized elements for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get mutable slice reference.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: ptr is valid for len initialized elements and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Get number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the allocation is page-aligned.
    pub fn is_page_aligned(&self) -> bool {
        self.ptr.as_ptr() as usize % PAGE_SIZE == 0
    }
}

impl<T: bytemuck::Pod> Drop for PinnedMemory<T> {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with self.layout.
        unsafe {
            dealloc(self.ptr.as_ptr() as *mut u8, self.layout);
        }
    }
}

// SAFETY: PinnedMemory uniquely owns its allocation.
unsafe impl<T: bytemuck::Pod + Send> Send for PinnedMemory<T> {}
unsafe impl<T: bytemuck::Pod + Sync> Sync for PinnedMemory<T> {}

enum HostStorage<T: bytemuck::Pod> {
    Pinned(PinnedMemory<T>),
    Pageable(Vec<T>),
}

impl<T: bytemuck::Pod> HostStorage<T> {
    fn as_slice(&self) -> &[T] {
        match self {
            HostStorage::Pinned(mem) => mem.as_slice(),
            HostStorage::Pageable(vec) => vec.as_slice(),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            HostStorage::Pinned(mem) => mem.as_mut_slice(),
            HostStorage::Pageable(vec) => vec.as_mut_slice(),
        }
    }
}

/// A host array and a device array kept in explicit, caller-triggered sync.
///
/// Callers only ever see the logical length through [`host`](Self::host);
/// transfers always move the full padded capacity.
pub struct MirroredBuffer<T: DeviceScalar> {
    len: usize,
    mode: HostMemory,
    host: HostStorage<T>,
    device: DeviceSlice<T>,
}

impl<T: DeviceScalar> MirroredBuffer<T> {
    /// Allocate zeroed host and device storage for `len` elements.
    ///
    /// The device side is allocated first, so a request over the device
    /// budget fails before any host memory is committed.
    pub fn new(device: &EmulatedDevice, len: usize, mode: HostMemory) -> Result<Self> {
        if len == 0 {
            return Err(CoulombError::InvalidConfig(
                "mirrored buffer length must be positive".to_string(),
            ));
        }

        let capacity = padded_len(len).ok_or(CoulombError::AllocationFailed {
            requested: usize::MAX,
            available: device.available(),
        })?;
        let device = device.alloc::<T>(capacity)?;
        let host = match mode {
            HostMemory::Pinned => HostStorage::Pinned(PinnedMemory::new(capacity)?),
            HostMemory::Pageable => HostStorage::Pageable(host_vec(capacity)?),
        };

        debug!(
            "Allocated {:?} mirrored buffer<{}> (len={}, capacity={})",
            mode,
            std::any::type_name::<T>(),
            len,
            capacity
        );

        Ok(Self {
            len,
            mode,
            host,
            device,
        })
    }

    /// Logical element count.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Padded element count of both allocations.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.device.len()
    }

    /// Host storage mode.
    pub fn mode(&self) -> HostMemory {
        self.mode
    }

    /// Host-side elements.
    pub fn host(&self) -> &[T] {
        &self.host.as_slice()[..self.len]
    }

    /// Mutable host-side elements.
    pub fn host_mut(&mut self) -> &mut [T] {
        let len = self.len;
        &mut self.host.as_mut_slice()[..len]
    }

    /// Device-side array.
    pub fn device_slice(&self) -> &DeviceSlice<T> {
        &self.device
    }

    /// Copy host to device (full capacity).
    pub fn upload(&self) -> Result<()> {
        self.device.device().check_transfer("HtoD")?;
        trace!(capacity = self.capacity(), "HtoD copy");
        self.device.copy_from_host(self.host.as_slice())
    }

    /// Copy device to host (full capacity).
    ///
    /// Waits for all launched work first.
    pub fn download(&mut self) -> Result<()> {
        self.device.device().synchronize()?;
        trace!(capacity = self.capacity(), "DtoH copy");
        self.device.copy_to_host(self.host.as_mut_slice())
    }
}

impl<T: DeviceScalar> std::fmt::Debug for MirroredBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirroredBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("mode", &self.mode)
            .finish()
    }
}
