//! Host-side stand-ins for platform and device.
//!
//! TEAM_452: Lets the queue, handshake and block driver run under
//! `cargo test` without hardware.
//!
//! - [`StdHal`] hands out identity-mapped heap memory, with an optional
//!   per-thread allocation budget for out-of-memory tests.
//! - [`FakeRegisters`] is a register file that behaves like a cooperative
//!   device, with knobs to make it misbehave.
//! - [`RingView`] is the device's side of a queue: it walks the available
//!   ring and writes the used ring in driver memory.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};
use std::alloc::Layout;
use std::vec::Vec;

use crate::hal::{BufferDirection, VirtioHal};
use crate::layout::QueueLayout;
use crate::queue::{Descriptor, DescriptorFlags, QueueError};
use crate::transport::{InterruptStatus, regs};
use crate::{DeviceStatus, VIRTIO_MAGIC};

std::thread_local! {
    static BUDGET: Cell<Option<usize>> = const { Cell::new(None) };
    static LIVE: Cell<usize> = const { Cell::new(0) };
}

/// Identity-mapped heap HAL.
pub struct StdHal;

impl StdHal {
    /// Let `count` more allocations on this thread succeed, then fail.
    pub fn limit_allocations(count: usize) {
        BUDGET.set(Some(count));
    }

    pub fn unlimited() {
        BUDGET.set(None);
    }

    /// Allocations made on this thread and not yet freed.
    pub fn live_allocations() -> usize {
        LIVE.get()
    }
}

// SAFETY: memory comes from the global allocator, zeroed, with the
// requested alignment, and the "physical" address is the pointer itself.
unsafe impl VirtioHal for StdHal {
    fn dma_alloc(
        size: usize,
        align: usize,
        _direction: BufferDirection,
    ) -> Option<(u64, NonNull<u8>)> {
        if let Some(left) = BUDGET.get() {
            if left == 0 {
                return None;
            }
            BUDGET.set(Some(left - 1));
        }
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        LIVE.set(LIVE.get() + 1);
        Some((ptr.as_ptr() as u64, ptr))
    }

    unsafe fn dma_dealloc(_paddr: u64, vaddr: NonNull<u8>, size: usize, align: usize) {
        if let Ok(layout) = Layout::from_size_align(size.max(1), align) {
            // SAFETY: caller passes back what dma_alloc returned.
            unsafe { std::alloc::dealloc(vaddr.as_ptr(), layout) };
            LIVE.set(LIVE.get().saturating_sub(1));
        }
    }
}

const CONFIG_SPACE: usize = 64;

/// Register file of a well-behaved virtio-mmio device.
#[derive(Debug)]
pub struct FakeRegisters {
    magic: u32,
    version: u32,
    device_id: u32,
    vendor_id: u32,
    device_features: u64,
    device_features_sel: u32,
    driver_features: u64,
    driver_features_sel: u32,
    queue_sel: u32,
    queue_max: u16,
    queue_size: u16,
    queue_addr: u64,
    queue_enable: u32,
    interrupt_status: u32,
    status: u32,
    generation: Cell<u32>,
    generation_churn: Cell<usize>,
    config: [u8; CONFIG_SPACE],
    reject_features: bool,
    refused_status: u32,
    stuck_status: u32,
    refuse_queue_enable: bool,
    writes: Vec<(usize, u32)>,
    notifications: Vec<u32>,
}

impl FakeRegisters {
    pub fn new(device_id: u32) -> Self {
        Self {
            magic: VIRTIO_MAGIC,
            version: 2,
            device_id,
            vendor_id: 0x554D_4551,
            device_features: 0,
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            queue_max: 16,
            queue_size: 0,
            queue_addr: 0,
            queue_enable: 0,
            interrupt_status: 0,
            status: 0,
            generation: Cell::new(0),
            generation_churn: Cell::new(0),
            config: [0; CONFIG_SPACE],
            reject_features: false,
            refused_status: 0,
            stuck_status: 0,
            refuse_queue_enable: false,
            writes: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn set_magic(&mut self, magic: u32) {
        self.magic = magic;
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn set_device_features(&mut self, features: u64) {
        self.device_features = features;
    }

    pub fn set_queue_max(&mut self, max: u16) {
        self.queue_max = max;
    }

    /// Copy `bytes` into config space at `offset`.
    pub fn set_config(&mut self, offset: usize, bytes: &[u8]) {
        self.config[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.generation.set(self.generation.get().wrapping_add(1));
    }

    /// Make the next `reads` generation reads each see a new value.
    pub fn set_generation_churn(&mut self, reads: usize) {
        self.generation_churn.set(reads);
    }

    /// Clear FEATURES_OK whenever the driver sets it.
    pub fn reject_features(&mut self, reject: bool) {
        self.reject_features = reject;
    }

    /// Status bits the device silently drops.
    pub fn refuse_status_bits(&mut self, bits: DeviceStatus) {
        self.refused_status = bits.bits();
    }

    /// Status bits that survive a reset.
    pub fn stick_status(&mut self, bits: DeviceStatus) {
        self.stuck_status = bits.bits();
        self.status |= bits.bits();
    }

    pub fn refuse_queue_enable(&mut self, refuse: bool) {
        self.refuse_queue_enable = refuse;
    }

    /// Device-side status change, e.g. raising NEEDS_RESET.
    pub fn set_status_bits(&mut self, bits: DeviceStatus) {
        self.status |= bits.bits();
    }

    pub fn raise_interrupt(&mut self, bits: InterruptStatus) {
        self.interrupt_status |= bits.bits();
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.status)
    }

    pub fn driver_features(&self) -> u64 {
        self.driver_features
    }

    pub fn queue_size(&self) -> u16 {
        self.queue_size
    }

    pub fn queue_address(&self) -> u64 {
        self.queue_addr
    }

    pub fn queue_enabled(&self) -> bool {
        self.queue_enable != 0
    }

    pub fn interrupt_pending(&self) -> InterruptStatus {
        InterruptStatus::from_bits_retain(self.interrupt_status)
    }

    /// Every register write in order, as `(offset, value)`.
    pub fn writes(&self) -> &[(usize, u32)] {
        &self.writes
    }

    /// Values written to the notify register.
    pub fn notifications(&self) -> &[u32] {
        &self.notifications
    }

    fn reset(&mut self) {
        self.status = self.stuck_status;
        self.driver_features = 0;
        self.queue_size = 0;
        self.queue_addr = 0;
        self.queue_enable = 0;
        self.interrupt_status = 0;
    }

    fn config_word(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        for (i, byte) in word.iter_mut().enumerate() {
            *byte = self.config.get(offset + i).copied().unwrap_or(0);
        }
        u32::from_le_bytes(word)
    }

    fn set_half(value: &mut u64, select: u32, half: u32) {
        match select {
            0 => *value = (*value & !0xFFFF_FFFF) | u64::from(half),
            1 => *value = (*value & 0xFFFF_FFFF) | (u64::from(half) << 32),
            _ => {}
        }
    }
}

impl crate::RegisterPort for FakeRegisters {
    fn read(&self, offset: usize) -> u32 {
        match offset {
            regs::MAGIC => self.magic,
            regs::VERSION => self.version,
            regs::DEVICE_ID => self.device_id,
            regs::VENDOR_ID => self.vendor_id,
            regs::DEVICE_FEATURES => match self.device_features_sel {
                0 => self.device_features as u32,
                1 => (self.device_features >> 32) as u32,
                _ => 0,
            },
            regs::DEVICE_FEATURES_SEL => self.device_features_sel,
            regs::DRIVER_FEATURES_SEL => self.driver_features_sel,
            regs::QUEUE_SEL => self.queue_sel,
            regs::QUEUE_SIZE => u32::from(self.queue_max),
            regs::QUEUE_ADDR_LOW => self.queue_addr as u32,
            regs::QUEUE_ADDR_HIGH => (self.queue_addr >> 32) as u32,
            regs::QUEUE_ENABLE => self.queue_enable,
            regs::INTERRUPT_STATUS => self.interrupt_status,
            regs::STATUS => self.status,
            regs::CONFIG_GENERATION => {
                let churn = self.generation_churn.get();
                if churn > 0 {
                    self.generation_churn.set(churn - 1);
                    self.generation.set(self.generation.get().wrapping_add(1));
                }
                self.generation.get()
            }
            o if o >= regs::CONFIG => self.config_word(o - regs::CONFIG),
            _ => 0,
        }
    }

    fn write(&mut self, offset: usize, value: u32) {
        self.writes.push((offset, value));
        match offset {
            regs::DEVICE_FEATURES_SEL => self.device_features_sel = value,
            regs::DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            regs::DRIVER_FEATURES => {
                Self::set_half(&mut self.driver_features, self.driver_features_sel, value);
            }
            regs::QUEUE_SEL => self.queue_sel = value,
            regs::QUEUE_SIZE => self.queue_size = value as u16,
            regs::QUEUE_ADDR_LOW => Self::set_half(&mut self.queue_addr, 0, value),
            regs::QUEUE_ADDR_HIGH => Self::set_half(&mut self.queue_addr, 1, value),
            regs::QUEUE_ENABLE => {
                self.queue_enable = if self.refuse_queue_enable { 0 } else { value };
            }
            regs::QUEUE_NOTIFY => self.notifications.push(value),
            regs::INTERRUPT_ACK => self.interrupt_status &= !value,
            regs::STATUS if value == 0 => self.reset(),
            regs::STATUS => {
                let mut status = value & !self.refused_status;
                if self.reject_features {
                    status &= !DeviceStatus::FEATURES_OK.bits();
                }
                self.status = status;
            }
            _ => {}
        }
    }
}

/// The device's view of a split virtqueue in identity-mapped memory.
#[derive(Debug)]
pub struct RingView {
    base: usize,
    layout: QueueLayout,
    last_avail: u16,
}

impl RingView {
    /// # Safety
    ///
    /// `paddr` must be the identity-mapped base of a live queue of `size`
    /// entries, and every descriptor address in it must be readable and
    /// writable for as long as the view is used.
    pub unsafe fn new(paddr: u64, size: u16) -> Result<Self, QueueError> {
        Ok(Self {
            base: paddr as usize,
            layout: QueueLayout::new(size)?,
            last_avail: 0,
        })
    }

    pub fn size(&self) -> u16 {
        self.layout.size()
    }

    fn ptr<T>(&self, offset: usize) -> *mut T {
        (self.base + offset) as *mut T
    }

    pub fn avail_idx(&self) -> u16 {
        // SAFETY: inside the queue per the constructor contract.
        unsafe { self.ptr::<u16>(self.layout.avail_idx_offset()).read_volatile() }
    }

    pub fn used_idx(&self) -> u16 {
        // SAFETY: as above.
        unsafe { self.ptr::<u16>(self.layout.used_idx_offset()).read_volatile() }
    }

    /// Next head the driver made available, if any.
    pub fn pop_avail(&mut self) -> Option<u16> {
        if self.avail_idx() == self.last_avail {
            return None;
        }
        fence(Ordering::Acquire);
        let slot = self.last_avail % self.size();
        // SAFETY: slot < size.
        let head =
            unsafe { self.ptr::<u16>(self.layout.avail_ring_offset(slot)).read_volatile() };
        self.last_avail = self.last_avail.wrapping_add(1);
        Some(head)
    }

    pub fn descriptor(&self, index: u16) -> Option<Descriptor> {
        if index >= self.size() {
            return None;
        }
        // SAFETY: index < size.
        Some(unsafe { self.ptr::<Descriptor>(self.layout.desc_offset(index)).read_volatile() })
    }

    /// Walk a chain from `head`, stopping after `size` steps.
    pub fn chain(&self, head: u16) -> Vec<Descriptor> {
        let mut out = Vec::new();
        let mut index = head;
        for _ in 0..self.size() {
            let Some(desc) = self.descriptor(index) else {
                break;
            };
            out.push(desc);
            if !desc.flags().contains(DescriptorFlags::NEXT) {
                break;
            }
            index = desc.next;
        }
        out
    }

    /// Copy out of the buffer a descriptor points at.
    pub fn read_buffer(&self, desc: &Descriptor, offset: usize, out: &mut [u8]) {
        let len = out.len().min((desc.len as usize).saturating_sub(offset));
        for (i, byte) in out.iter_mut().take(len).enumerate() {
            // SAFETY: within desc.len of a driver-owned buffer.
            *byte = unsafe { ((desc.addr as usize + offset + i) as *const u8).read_volatile() };
        }
    }

    /// Copy into the buffer a descriptor points at, clamped to its length.
    pub fn write_buffer(&self, desc: &Descriptor, offset: usize, data: &[u8]) {
        let len = data.len().min((desc.len as usize).saturating_sub(offset));
        for (i, byte) in data.iter().take(len).enumerate() {
            // SAFETY: within desc.len of a driver-owned buffer.
            unsafe { ((desc.addr as usize + offset + i) as *mut u8).write_volatile(*byte) };
        }
    }

    /// Overwrite the used index without touching the ring entries.
    pub fn set_used_idx(&mut self, idx: u16) {
        // SAFETY: inside the queue per the constructor contract.
        unsafe { self.ptr::<u16>(self.layout.used_idx_offset()).write_volatile(idx) };
    }

    /// Put a completion on the used ring and advance its index.
    pub fn push_used(&mut self, id: u32, len: u32) {
        let used_idx = self.used_idx();
        let slot = used_idx % self.size();
        let at = self.layout.used_ring_offset(slot);
        // SAFETY: slot < size.
        unsafe {
            self.ptr::<u32>(at).write_volatile(id);
            self.ptr::<u32>(at + 4).write_volatile(len);
        }
        // Memory barrier before updating the index
        fence(Ordering::Release);
        // SAFETY: inside the queue.
        unsafe {
            self.ptr::<u16>(self.layout.used_idx_offset())
                .write_volatile(used_idx.wrapping_add(1));
        }
    }
}
