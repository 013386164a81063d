//! # los_virtio
//!
//! VirtIO MMIO transport layer for LevitateOS.
//!
//! TEAM_098: Created as part of VirtIO GPU refactor.
//! TEAM_452: Reworked around the block driver: register port seam, verified
//!           handshake state machine, arena-backed split virtqueue.
//!
//! This crate provides the device-independent half of a virtio driver:
//! - [`RegisterPort`] / [`MmioPort`] - 32-bit register access with read-back
//! - [`MmioTransport`] - the register map and multi-part field access
//! - [`DeviceHandshake`] - status state machine from reset to `DRIVER_OK`
//! - [`VirtQueue`] - descriptor table, available ring and used ring in one
//!   DMA allocation, with the free-descriptor list
//! - [`VirtioHal`] - DMA allocation capability supplied by the platform

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod barrier;
pub mod hal;
mod handshake;
mod layout;
mod port;
mod queue;
mod transport;

#[cfg(feature = "std")]
pub mod testing;

pub use hal::{BufferDirection, DmaBuffer, PAGE_SIZE, VirtioHal};
pub use handshake::{DeviceHandshake, DeviceIdentity, DeviceTypePolicy, HandshakeState};
pub use layout::{MAX_QUEUE_SIZE, QueueLayout};
pub use port::{MmioPort, RegisterPort};
pub use queue::{
    ChainIter, Descriptor, DescriptorFlags, QueueError, UsedElement, UsedIter, VirtQueue,
};
pub use transport::{DeviceType, InterruptStatus, MmioTransport, TransportError, regs};

use bitflags::bitflags;

/// VirtIO MMIO magic value ("virt" in little-endian).
pub const VIRTIO_MAGIC: u32 = 0x7472_6976;

bitflags! {
    /// Device status bits per VirtIO 1.1 spec section 2.1.
    ///
    /// The status byte is a monotonic set until the device is reset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

/// VirtIO feature bits common to all devices.
///
/// Only `VERSION_1` is ever requested; the ring extensions are listed so the
/// driver can log what a device offers.
pub mod features {
    pub const RING_INDIRECT_DESC: u64 = 1 << 28;
    pub const RING_EVENT_IDX: u64 = 1 << 29;
    pub const VERSION_1: u64 = 1 << 32;
    pub const ACCESS_PLATFORM: u64 = 1 << 33;
    pub const RING_PACKED: u64 = 1 << 34;
    pub const IN_ORDER: u64 = 1 << 35;
}
