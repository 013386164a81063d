//! Hardware Abstraction Layer for VirtIO
//!
//! TEAM_098: Created as part of VirtIO GPU refactor.
//! TEAM_452: Allocation is now fallible and byte-sized so queue setup can
//!           report `OutOfMemory` instead of panicking in the HAL.
//!
//! This module defines the HAL trait that platform code must implement
//! for DMA allocation, and the owning [`DmaBuffer`] handle built on it.

use core::marker::PhantomData;
use core::ptr::NonNull;

use volatile::VolatilePtr;

/// Direction of buffer access for DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDirection {
    /// Driver writes to buffer, device reads.
    DriverToDevice,
    /// Device writes to buffer, driver reads.
    DeviceToDriver,
    /// Both driver and device may access.
    Both,
}

/// Hardware Abstraction Layer for VirtIO devices.
///
/// Platform code must implement this trait to provide DMA memory and the
/// physical addresses the device will use to reach it.
///
/// # Safety
///
/// Implementations must ensure:
/// - DMA memory is physically contiguous for the requested size
/// - Returned memory is zeroed and aligned to at least `align`
/// - The physical address maps to the returned virtual pointer for the
///   lifetime of the allocation
pub unsafe trait VirtioHal {
    /// Allocate `size` bytes of zeroed DMA-capable memory.
    ///
    /// Returns `(physical_address, virtual_pointer)`, or `None` when the
    /// backing allocator cannot satisfy the request.
    fn dma_alloc(
        size: usize,
        align: usize,
        direction: BufferDirection,
    ) -> Option<(u64, NonNull<u8>)>;

    /// Deallocate DMA memory.
    ///
    /// # Safety
    ///
    /// `paddr`, `vaddr`, `size` and `align` must match a previous call to
    /// `dma_alloc`, and the device must no longer reference the memory.
    unsafe fn dma_dealloc(paddr: u64, vaddr: NonNull<u8>, size: usize, align: usize);
}

/// Size of a page; ring memory is allocated at this alignment.
pub const PAGE_SIZE: usize = 4096;

/// An owned DMA allocation, released through the HAL on drop.
pub struct DmaBuffer<H: VirtioHal> {
    paddr: u64,
    vaddr: NonNull<u8>,
    size: usize,
    align: usize,
    _hal: PhantomData<H>,
}

// SAFETY: the buffer is uniquely owned; the raw pointer is only a handle to
// memory nothing else in the driver aliases.
unsafe impl<H: VirtioHal> Send for DmaBuffer<H> {}
unsafe impl<H: VirtioHal> Sync for DmaBuffer<H> {}

impl<H: VirtioHal> DmaBuffer<H> {
    /// Allocate a zeroed buffer, `None` if the HAL is exhausted.
    pub fn new(size: usize, align: usize, direction: BufferDirection) -> Option<Self> {
        let (paddr, vaddr) = H::dma_alloc(size, align, direction)?;
        Some(Self {
            paddr,
            vaddr,
            size,
            align,
            _hal: PhantomData,
        })
    }

    /// Physical address handed to the device.
    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Volatile pointer to a `T` at `offset`, or `None` if it would not fit.
    ///
    /// Every access to ring and buffer memory goes through here so that an
    /// out-of-range offset can never produce a wild pointer.
    pub(crate) fn field<T: Copy>(&self, offset: usize) -> Option<VolatilePtr<'_, T>> {
        let end = offset.checked_add(core::mem::size_of::<T>())?;
        if end > self.size {
            return None;
        }
        // SAFETY: offset..end lies inside our allocation.
        let raw = unsafe { self.vaddr.as_ptr().add(offset) }.cast::<T>();
        if !raw.is_aligned() {
            return None;
        }
        // SAFETY: raw is non-null, in bounds and aligned for T.
        Some(unsafe { VolatilePtr::new(NonNull::new_unchecked(raw)) })
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> bool {
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        if end > self.size {
            return false;
        }
        for (i, byte) in data.iter().enumerate() {
            if let Some(ptr) = self.field::<u8>(offset + i) {
                ptr.write(*byte);
            }
        }
        true
    }

    /// Copy bytes out of the buffer at `offset` into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> bool {
        let Some(end) = offset.checked_add(out.len()) else {
            return false;
        };
        if end > self.size {
            return false;
        }
        for (i, byte) in out.iter_mut().enumerate() {
            if let Some(ptr) = self.field::<u8>(offset + i) {
                *byte = ptr.read();
            }
        }
        true
    }

    /// Volatile read of a single byte, e.g. a device-written status.
    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.field::<u8>(offset).map(VolatilePtr::read)
    }
}

impl<H: VirtioHal> Drop for DmaBuffer<H> {
    fn drop(&mut self) {
        // SAFETY: these values came from H::dma_alloc in `new`.
        unsafe { H::dma_dealloc(self.paddr, self.vaddr, self.size, self.align) };
    }
}

impl<H: VirtioHal> core::fmt::Debug for DmaBuffer<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .field("size", &self.size)
            .finish()
    }
}
