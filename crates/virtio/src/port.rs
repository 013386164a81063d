//! 32-bit register port.
//!
//! TEAM_452: Split out of the transport so the handshake and queue notify
//! paths can run against a fake register file on the host.

use core::ptr::NonNull;

use volatile::VolatilePtr;

/// Access to a bank of 32-bit device registers.
///
/// Offsets are byte offsets from the start of the bank and are always
/// 4-byte aligned.
pub trait RegisterPort {
    /// Volatile read of the register at `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Volatile write of `value` to the register at `offset`.
    fn write(&mut self, offset: usize, value: u32);

    /// Write, then read the same register back.
    ///
    /// Only meaningful for registers the device reflects; see
    /// [`crate::regs::supports_readback`].
    fn write_readback(&mut self, offset: usize, value: u32) -> u32 {
        debug_assert!(
            crate::regs::supports_readback(offset),
            "register {offset:#x} does not read back"
        );
        self.write(offset, value);
        self.read(offset)
    }
}

/// Memory-mapped register bank.
#[derive(Debug)]
pub struct MmioPort {
    base: usize,
}

impl MmioPort {
    /// Create a port over the register bank at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped VirtIO MMIO region
    /// covering at least the device's config space, and nothing else may
    /// write to it while the port is alive.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    fn reg(&self, offset: usize) -> VolatilePtr<'_, u32> {
        debug_assert!(offset % 4 == 0, "unaligned register offset {offset:#x}");
        // SAFETY: Caller of `new` guarantees base is a valid MMIO mapping,
        // and a non-zero base plus offset is never null.
        unsafe { VolatilePtr::new(NonNull::new_unchecked((self.base + offset) as *mut u32)) }
    }
}

impl RegisterPort for MmioPort {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        self.reg(offset).read()
    }

    #[inline]
    fn write(&mut self, offset: usize, value: u32) {
        self.reg(offset).write(value);
    }
}
