//! Block storage abstraction.
//!
//! Filesystems talk to this trait, not to a particular driver. Blocks are
//! addressed in units of [`StorageDevice::block_size`].

#![no_std]

use los_error::define_kernel_error;

define_kernel_error! {
    /// Errors surfaced to filesystem code.
    pub enum StorageError(0x0D) {
        /// Device has not finished initialization or has been shut down
        NotReady = 0x01 => "Storage device not ready",
        /// Block index past the end of the device
        OutOfRange = 0x02 => "Block out of range",
        /// Buffer length is not a whole number of blocks
        BadBufferSize = 0x03 => "Buffer is not a multiple of the block size",
        /// Device reported an I/O error
        Io = 0x04 => "Storage I/O error",
        /// Write or flush on read-only media
        ReadOnly = 0x05 => "Storage device is read-only",
        /// Request kind not implemented by the device
        Unsupported = 0x06 => "Operation not supported",
        /// No capacity right now; retry later
        Busy = 0x07 => "Storage device busy" [transient],
        /// Device did not answer in time
        Timeout = 0x08 => "Storage request timed out" [transient],
    }
}

/// A block-addressed storage device.
pub trait StorageDevice {
    /// Bytes per block.
    fn block_size(&self) -> usize;

    /// Total number of blocks.
    fn size_in_blocks(&self) -> usize;

    /// Fill `buf` from consecutive blocks starting at `block_id`.
    ///
    /// `buf.len()` must be a multiple of [`block_size`](Self::block_size).
    fn read_blocks(&mut self, block_id: usize, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write `buf` to consecutive blocks starting at `block_id`.
    fn write_blocks(&mut self, block_id: usize, buf: &[u8]) -> Result<(), StorageError>;

    /// Make previous writes durable. Devices without a cache can ignore this.
    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
