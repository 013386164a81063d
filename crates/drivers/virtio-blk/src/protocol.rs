//! VirtIO block wire protocol.
//!
//! Request header, status byte values, feature bits and the device
//! configuration block. All multi-byte fields are little-endian.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use los_virtio::{MmioTransport, RegisterPort, TransportError};

/// Bytes per sector in request headers, independent of the logical block size.
pub const SECTOR_SIZE: u32 = 512;

/// Largest logical block size accepted from the `BLK_SIZE` field.
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024;

bitflags! {
    /// VirtIO block feature bits (VirtIO 1.1 section 5.2.3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlkFeatures: u64 {
        const SIZE_MAX = 1 << 1;
        const SEG_MAX = 1 << 2;
        const GEOMETRY = 1 << 4;
        const RO = 1 << 5;
        const BLK_SIZE = 1 << 6;
        const FLUSH = 1 << 9;
        const TOPOLOGY = 1 << 10;
        const CONFIG_WCE = 1 << 11;
        const MQ = 1 << 12;
        const DISCARD = 1 << 13;
        const WRITE_ZEROES = 1 << 14;
        const SECURE_ERASE = 1 << 16;
        const RING_INDIRECT_DESC = 1 << 28;
        const RING_EVENT_IDX = 1 << 29;
        const VERSION_1 = 1 << 32;

        /// What this driver knows how to use.
        const DRIVER_DEFAULT = Self::VERSION_1.bits()
            | Self::BLK_SIZE.bits()
            | Self::FLUSH.bits()
            | Self::RO.bits()
            | Self::GEOMETRY.bits()
            | Self::TOPOLOGY.bits()
            | Self::SIZE_MAX.bits()
            | Self::SEG_MAX.bits();
    }
}

/// Request type field of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestType {
    In = 0,
    Out = 1,
    Flush = 4,
    GetSize = 8,
}

/// Status byte written by the device.
pub mod status {
    pub const OK: u8 = 0;
    pub const IOERR: u8 = 1;
    pub const UNSUPP: u8 = 2;
    /// Written by the driver before submission; a device that completes
    /// without overwriting it has violated the protocol.
    pub const UNSET: u8 = 0xFF;
}

/// Request header (first descriptor of every chain).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RequestHeader {
    pub request_type: u32,
    pub reserved: u32,
    pub sector: u64,
}

const _: () = assert!(core::mem::size_of::<RequestHeader>() == 16);

impl RequestHeader {
    pub fn new(request_type: RequestType, sector: u64) -> Self {
        Self {
            request_type: (request_type as u32).to_le(),
            reserved: 0,
            sector: sector.to_le(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Offsets inside the device config block.
mod config_offset {
    pub const CAPACITY: usize = 0;
    pub const SIZE_MAX: usize = 8;
    pub const SEG_MAX: usize = 12;
    pub const CYLINDERS: usize = 16;
    pub const HEADS: usize = 18;
    pub const SECTORS: usize = 19;
    pub const BLK_SIZE: usize = 20;
    pub const PHYSICAL_BLOCK_EXP: usize = 24;
    pub const ALIGNMENT_OFFSET: usize = 25;
    pub const MIN_IO_SIZE: usize = 26;
    pub const OPT_IO_SIZE: usize = 28;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Topology {
    pub physical_block_exp: u8,
    pub alignment_offset: u8,
    pub min_io_size: u16,
    pub opt_io_size: u32,
}

/// Device configuration block.
///
/// Fields other than `capacity` are only meaningful when the matching
/// feature was negotiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockConfig {
    /// Size in 512-byte sectors.
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub geometry: Geometry,
    pub blk_size: u32,
    pub topology: Topology,
}

impl BlockConfig {
    /// Read the whole block under one config generation.
    pub fn read<P: RegisterPort>(transport: &MmioTransport<P>) -> Result<Self, TransportError> {
        transport.read_config(|t| Self {
            capacity: t.config_u64(config_offset::CAPACITY),
            size_max: t.config_u32(config_offset::SIZE_MAX),
            seg_max: t.config_u32(config_offset::SEG_MAX),
            geometry: Geometry {
                cylinders: t.config_u16(config_offset::CYLINDERS),
                heads: t.config_u8(config_offset::HEADS),
                sectors: t.config_u8(config_offset::SECTORS),
            },
            blk_size: t.config_u32(config_offset::BLK_SIZE),
            topology: Topology {
                physical_block_exp: t.config_u8(config_offset::PHYSICAL_BLOCK_EXP),
                alignment_offset: t.config_u8(config_offset::ALIGNMENT_OFFSET),
                min_io_size: t.config_u16(config_offset::MIN_IO_SIZE),
                opt_io_size: t.config_u32(config_offset::OPT_IO_SIZE),
            },
        })
    }

    /// Capacity only, for re-reads after a config change interrupt.
    pub fn read_capacity<P: RegisterPort>(
        transport: &MmioTransport<P>,
    ) -> Result<u64, TransportError> {
        transport.read_config(|t| t.config_u64(config_offset::CAPACITY))
    }

    /// Logical block size to use given the negotiated features.
    ///
    /// Falls back to 512 if `BLK_SIZE` was not negotiated or the device
    /// reports something that is not a power of two in `512..=64K`.
    pub fn logical_block_size(&self, features: BlkFeatures) -> u32 {
        if !features.contains(BlkFeatures::BLK_SIZE) {
            return SECTOR_SIZE;
        }
        let size = self.blk_size;
        if size.is_power_of_two() && (SECTOR_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
            size
        } else {
            log::warn!("[VIRTIO-BLK] Ignoring invalid blk_size {size}");
            SECTOR_SIZE
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use los_virtio::testing::FakeRegisters;

    /// Tests: header is 16 little-endian bytes
    #[test]
    fn test_header_bytes() {
        let header = RequestHeader::new(RequestType::Out, 0x0102_0304_0506_0708);
        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    /// Tests: driver default feature set
    #[test]
    fn test_driver_default_features() {
        let f = BlkFeatures::DRIVER_DEFAULT;
        assert!(f.contains(BlkFeatures::VERSION_1 | BlkFeatures::FLUSH | BlkFeatures::BLK_SIZE));
        assert!(!f.intersects(
            BlkFeatures::MQ
                | BlkFeatures::DISCARD
                | BlkFeatures::WRITE_ZEROES
                | BlkFeatures::SECURE_ERASE
                | BlkFeatures::RING_INDIRECT_DESC
                | BlkFeatures::RING_EVENT_IDX
        ));
    }

    /// Tests: config block fields at their offsets
    #[test]
    fn test_config_read() {
        let mut regs = FakeRegisters::new(2);
        regs.set_config(0, &2048u64.to_le_bytes());
        regs.set_config(12, &128u32.to_le_bytes());
        regs.set_config(16, &[0x10, 0x00, 16, 63]);
        regs.set_config(20, &4096u32.to_le_bytes());
        regs.set_config(24, &[3, 0, 8, 0]);
        let transport = MmioTransport::new(regs);

        let config = BlockConfig::read(&transport).unwrap();
        assert_eq!(config.capacity, 2048);
        assert_eq!(config.seg_max, 128);
        assert_eq!(
            config.geometry,
            Geometry {
                cylinders: 16,
                heads: 16,
                sectors: 63
            }
        );
        assert_eq!(config.blk_size, 4096);
        assert_eq!(config.topology.physical_block_exp, 3);
        assert_eq!(config.topology.min_io_size, 8);
    }

    /// Tests: block size honours BLK_SIZE only when negotiated and sane
    #[test]
    fn test_logical_block_size() {
        let config = BlockConfig {
            blk_size: 4096,
            ..BlockConfig::default()
        };
        assert_eq!(config.logical_block_size(BlkFeatures::empty()), 512);
        assert_eq!(config.logical_block_size(BlkFeatures::BLK_SIZE), 4096);

        let odd = BlockConfig {
            blk_size: 1000,
            ..BlockConfig::default()
        };
        assert_eq!(odd.logical_block_size(BlkFeatures::BLK_SIZE), 512);
    }
}
