//! VirtIO MMIO transport.
//!
//! TEAM_098: Created as part of VirtIO GPU refactor.
//! TEAM_452: Generic over [`RegisterPort`]; adds read-back verification,
//!           the block-device register map and generation-checked config reads.
//!
//! This module owns the register map and the multi-register fields
//! (64-bit features, 64-bit queue address, config space). It has no notion
//! of handshake order; see [`crate::DeviceHandshake`] for that.

use bitflags::bitflags;
use los_error::define_kernel_error;

use crate::port::RegisterPort;
use crate::{DeviceStatus, VIRTIO_MAGIC};

define_kernel_error! {
    /// Errors raised while identifying or negotiating with a device.
    pub enum TransportError(0x0B) {
        /// Magic value at offset 0 did not match
        DeviceNotFound = 0x01 => "No VirtIO device at base address",
        /// Version register is not 1 or 2
        UnsupportedVersion = 0x02 => "Unsupported VirtIO MMIO version",
        /// Device id is not the class the driver binds to
        UnexpectedDeviceType = 0x03 => "Unexpected device type",
        /// Status read-back did not show the bits just written
        StatusRejected = 0x04 => "Device rejected status transition",
        /// Device cleared FEATURES_OK after negotiation
        FeaturesRejected = 0x05 => "Device rejected negotiated features",
        /// Device reports a maximum queue size of zero
        QueueUnavailable = 0x06 => "Queue not available",
        /// Queue address or enable read-back mismatch
        QueueSetupFailed = 0x07 => "Queue setup not confirmed",
        /// Status never returned to zero after reset
        ResetTimeout = 0x08 => "Device did not complete reset",
        /// Config generation kept changing while reading
        ConfigUnstable = 0x09 => "Config space changed during read" [transient],
        /// Handshake step issued from the wrong state
        OutOfOrder = 0x0A => "Handshake step out of order",
    }
}

/// VirtIO device type identifiers per VirtIO 1.1 spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceType {
    Invalid = 0,
    Network = 1,
    Block = 2,
    Console = 3,
    Entropy = 4,
    Balloon = 5,
    Scsi = 8,
    Gpu = 16,
    Input = 18,
    Socket = 19,
}

impl From<u32> for DeviceType {
    fn from(value: u32) -> Self {
        match value {
            1 => DeviceType::Network,
            2 => DeviceType::Block,
            3 => DeviceType::Console,
            4 => DeviceType::Entropy,
            5 => DeviceType::Balloon,
            8 => DeviceType::Scsi,
            16 => DeviceType::Gpu,
            18 => DeviceType::Input,
            19 => DeviceType::Socket,
            _ => DeviceType::Invalid,
        }
    }
}

bitflags! {
    /// Bits of the interrupt status / acknowledge registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        const USED_BUFFER = 1;
        const CONFIG_CHANGE = 2;
    }
}

/// VirtIO MMIO register offsets for the LevitateOS block transport.
pub mod regs {
    pub const MAGIC: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const VENDOR_ID: usize = 0x00C;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    pub const QUEUE_SEL: usize = 0x030;
    /// Read: device maximum. Write: size chosen by the driver.
    pub const QUEUE_SIZE: usize = 0x034;
    pub const QUEUE_ADDR_LOW: usize = 0x038;
    pub const QUEUE_ADDR_HIGH: usize = 0x03C;
    pub const QUEUE_ENABLE: usize = 0x040;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const CONFIG_GENERATION: usize = 0x080;
    pub const CONFIG: usize = 0x090;

    /// Whether reading `offset` right after writing it returns the written value.
    pub const fn supports_readback(offset: usize) -> bool {
        matches!(
            offset,
            DEVICE_FEATURES_SEL
                | DRIVER_FEATURES_SEL
                | QUEUE_SEL
                | QUEUE_ADDR_LOW
                | QUEUE_ADDR_HIGH
                | QUEUE_ENABLE
                | STATUS
        )
    }
}

/// Attempts at a generation-stable config read before giving up.
const CONFIG_READ_RETRIES: usize = 8;

/// VirtIO MMIO transport over a register port.
#[derive(Debug)]
pub struct MmioTransport<P: RegisterPort> {
    port: P,
}

impl<P: RegisterPort> MmioTransport<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn magic(&self) -> u32 {
        self.port.read(regs::MAGIC)
    }

    pub fn has_magic(&self) -> bool {
        self.magic() == VIRTIO_MAGIC
    }

    pub fn version(&self) -> u32 {
        self.port.read(regs::VERSION)
    }

    pub fn device_id(&self) -> u32 {
        self.port.read(regs::DEVICE_ID)
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::from(self.device_id())
    }

    pub fn vendor_id(&self) -> u32 {
        self.port.read(regs::VENDOR_ID)
    }

    /// Read the 64-bit device feature set through the selector.
    pub fn read_device_features(&mut self) -> u64 {
        self.port.write(regs::DEVICE_FEATURES_SEL, 0);
        let low = u64::from(self.port.read(regs::DEVICE_FEATURES));
        self.port.write(regs::DEVICE_FEATURES_SEL, 1);
        let high = u64::from(self.port.read(regs::DEVICE_FEATURES));
        (high << 32) | low
    }

    /// Write the 64-bit driver feature set through the selector.
    pub fn write_driver_features(&mut self, features: u64) {
        self.port.write(regs::DRIVER_FEATURES_SEL, 0);
        self.port.write(regs::DRIVER_FEATURES, features as u32);
        self.port.write(regs::DRIVER_FEATURES_SEL, 1);
        self.port.write(regs::DRIVER_FEATURES, (features >> 32) as u32);
    }

    pub fn read_status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.port.read(regs::STATUS))
    }

    /// Write the status register and return what the device reports back.
    pub fn write_status(&mut self, status: DeviceStatus) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.port.write_readback(regs::STATUS, status.bits()))
    }

    /// Select a queue; false if the selector did not latch.
    pub fn select_queue(&mut self, queue: u16) -> bool {
        self.port.write_readback(regs::QUEUE_SEL, u32::from(queue)) == u32::from(queue)
    }

    /// Maximum size the device supports for the selected queue.
    pub fn max_queue_size(&self) -> u16 {
        u16::try_from(self.port.read(regs::QUEUE_SIZE)).unwrap_or(u16::MAX)
    }

    pub fn set_queue_size(&mut self, size: u16) {
        self.port.write(regs::QUEUE_SIZE, u32::from(size));
    }

    /// Program the selected queue's base address; false on read-back mismatch.
    pub fn set_queue_address(&mut self, paddr: u64) -> bool {
        let low = paddr as u32;
        let high = (paddr >> 32) as u32;
        let seen_low = self.port.write_readback(regs::QUEUE_ADDR_LOW, low);
        let seen_high = self.port.write_readback(regs::QUEUE_ADDR_HIGH, high);
        seen_low == low && seen_high == high
    }

    /// Enable the selected queue; false if the device does not report it enabled.
    pub fn enable_queue(&mut self) -> bool {
        self.port.write_readback(regs::QUEUE_ENABLE, 1) == 1
    }

    pub fn disable_queue(&mut self) {
        self.port.write(regs::QUEUE_ENABLE, 0);
    }

    pub fn queue_notify(&mut self, queue: u16) {
        self.port.write(regs::QUEUE_NOTIFY, u32::from(queue));
    }

    pub fn interrupt_status(&self) -> InterruptStatus {
        InterruptStatus::from_bits_retain(self.port.read(regs::INTERRUPT_STATUS))
    }

    pub fn ack_interrupt(&mut self, status: InterruptStatus) {
        self.port.write(regs::INTERRUPT_ACK, status.bits());
    }

    pub fn config_generation(&self) -> u32 {
        self.port.read(regs::CONFIG_GENERATION)
    }

    /// Raw config-space word at `offset` (not generation checked).
    pub fn config_u32(&self, offset: usize) -> u32 {
        self.port.read(regs::CONFIG + offset)
    }

    /// Raw little-endian 64-bit config field, low word first.
    pub fn config_u64(&self, offset: usize) -> u64 {
        let low = u64::from(self.config_u32(offset));
        let high = u64::from(self.config_u32(offset + 4));
        (high << 32) | low
    }

    /// Raw 16-bit config field; `offset` must be 2-byte aligned.
    pub fn config_u16(&self, offset: usize) -> u16 {
        let bytes = self.config_u32(offset & !3).to_le_bytes();
        let at = offset & 2;
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    /// Raw config byte.
    pub fn config_u8(&self, offset: usize) -> u8 {
        self.config_u32(offset & !3).to_le_bytes()[offset & 3]
    }

    /// Run `read` until the config generation is the same before and after.
    ///
    /// Multi-word fields can tear if the device updates config space in the
    /// middle of a read; the generation counter detects that.
    pub fn read_config<R>(&self, mut read: impl FnMut(&Self) -> R) -> Result<R, TransportError> {
        for _ in 0..CONFIG_READ_RETRIES {
            let before = self.config_generation();
            let value = read(self);
            if self.config_generation() == before {
                return Ok(value);
            }
        }
        log::warn!("[VIRTIO] Config generation unstable after {CONFIG_READ_RETRIES} reads");
        Err(TransportError::ConfigUnstable)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::testing::FakeRegisters;

    fn transport() -> MmioTransport<FakeRegisters> {
        MmioTransport::new(FakeRegisters::new(DeviceType::Block as u32))
    }

    /// Tests: 64-bit features are assembled from both selector halves
    #[test]
    fn test_device_features_both_halves() {
        let mut t = transport();
        t.port_mut().set_device_features((1 << 32) | (1 << 9));
        assert_eq!(t.read_device_features(), (1 << 32) | (1 << 9));
    }

    /// Tests: driver features land in the right halves
    #[test]
    fn test_driver_features_split() {
        let mut t = transport();
        t.write_driver_features((1 << 32) | 0x40);
        assert_eq!(t.port().driver_features(), (1 << 32) | 0x40);
    }

    /// Tests: queue address is split low then high and verified
    #[test]
    fn test_queue_address_readback() {
        let mut t = transport();
        assert!(t.select_queue(0));
        assert!(t.set_queue_address(0x1_2345_6000));
        assert_eq!(t.port().queue_address(), 0x1_2345_6000);
    }

    /// Tests: queue size register reads device max, write records chosen size
    #[test]
    fn test_queue_size_read_max_write_chosen() {
        let mut t = transport();
        t.port_mut().set_queue_max(128);
        assert_eq!(t.max_queue_size(), 128);
        t.set_queue_size(64);
        assert_eq!(t.port().queue_size(), 64);
        // Reading still reports the maximum
        assert_eq!(t.max_queue_size(), 128);
    }

    /// Tests: sub-word config fields come from the containing word
    #[test]
    fn test_config_sub_word_reads() {
        let t = {
            let mut t = transport();
            t.port_mut().set_config(16, &[0x34, 0x12, 0x07, 0x3F]);
            t
        };
        assert_eq!(t.config_u16(16), 0x1234);
        assert_eq!(t.config_u8(18), 0x07);
        assert_eq!(t.config_u8(19), 0x3F);
        assert_eq!(t.config_u32(16), 0x3F07_1234);
    }

    /// Tests: generation-checked read retries until stable
    #[test]
    fn test_config_generation_retry() {
        let mut t = transport();
        t.port_mut().set_config(0, &512u64.to_le_bytes());
        // Generation changes on the first two reads only
        t.port_mut().set_generation_churn(2);
        let value = t.read_config(|t| t.config_u64(0));
        assert_eq!(value, Ok(512));
    }

    /// Tests: a config space that never settles is reported
    #[test]
    fn test_config_generation_unstable() {
        let mut t = transport();
        t.port_mut().set_generation_churn(usize::MAX);
        assert_eq!(
            t.read_config(|t| t.config_u32(0)),
            Err(TransportError::ConfigUnstable)
        );
    }

    /// Tests: only latched registers advertise read-back
    #[test]
    fn test_supports_readback() {
        assert!(regs::supports_readback(regs::STATUS));
        assert!(regs::supports_readback(regs::QUEUE_ENABLE));
        assert!(!regs::supports_readback(regs::QUEUE_SIZE));
        assert!(!regs::supports_readback(regs::QUEUE_NOTIFY));
        assert!(!regs::supports_readback(regs::DRIVER_FEATURES));
    }

    /// Tests: DeviceType mapping of known and unknown ids
    #[test]
    fn test_device_type_from_id() {
        assert_eq!(DeviceType::from(2), DeviceType::Block);
        assert_eq!(DeviceType::from(16), DeviceType::Gpu);
        assert_eq!(DeviceType::from(0xFFFF), DeviceType::Invalid);
    }
}
