//! Memory barriers between the driver and a DMA-capable device.
//!
//! TEAM_109: ARM DSB to ensure ring writes are visible to the device.
//! TEAM_452: Moved out of the queue so the notify path can share it.

use core::sync::atomic::{Ordering, fence};

/// Complete all prior ring writes before the write that publishes them
/// (avail index store, queue notify).
pub fn publish() {
    fence(Ordering::Release);
    #[cfg(target_arch = "aarch64")]
    {
        use aarch64_cpu::asm::barrier;
        barrier::dsb(barrier::SY);
    }
}

/// Order the read of the device's used index before reads of the
/// elements and buffers it covers.
pub fn consume() {
    #[cfg(target_arch = "aarch64")]
    {
        use aarch64_cpu::asm::barrier;
        barrier::dmb(barrier::SY);
    }
    fence(Ordering::Acquire);
}
