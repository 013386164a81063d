//! # virtio-blk
//!
//! VirtIO block driver for LevitateOS.
//!
//! TEAM_452: Replaces the virtio-drivers backed `kernel/src/block.rs`.
//!
//! - Handshake and queue setup over [`los_virtio`]
//! - Three-descriptor request chains (header, data, status)
//! - Non-blocking submit/poll with per-request tokens and wakers
//! - Blocking read/write/flush on top, with admission backoff
//! - [`StorageDevice`](storage_device::StorageDevice) for filesystems

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod poller;
pub mod protocol;
pub mod request;
pub mod shared;
mod storage;

pub use config::DriverConfig;
pub use device::{DeviceInfo, DriverState, VirtioBlk};
pub use error::BlockError;
pub use poller::{DriverTelemetry, PendingTable, RequestToken, map_status};
pub use protocol::{BlkFeatures, BlockConfig, Geometry, RequestHeader, RequestType, SECTOR_SIZE};
pub use request::BlockRequest;
pub use shared::{SharedGuard, SharedVirtioBlk};
