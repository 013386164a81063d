//! [`StorageDevice`] for the virtio block driver.

use storage_device::{StorageDevice, StorageError};

use los_virtio::{RegisterPort, VirtioHal};

use crate::device::VirtioBlk;

impl<H: VirtioHal, P: RegisterPort> VirtioBlk<H, P> {
    /// Check `len` bytes starting at `block_id` fit on the device.
    fn check_span(&self, block_id: usize, len: usize) -> Result<usize, StorageError> {
        let block_size = self.sector_size() as usize;
        if len == 0 || len % block_size != 0 {
            return Err(StorageError::BadBufferSize);
        }
        let count = len / block_size;
        let end = block_id.checked_add(count).ok_or(StorageError::OutOfRange)?;
        if end as u64 > self.capacity() {
            return Err(StorageError::OutOfRange);
        }
        Ok(block_size)
    }
}

impl<H: VirtioHal, P: RegisterPort> StorageDevice for VirtioBlk<H, P> {
    fn block_size(&self) -> usize {
        self.sector_size() as usize
    }

    fn size_in_blocks(&self) -> usize {
        usize::try_from(self.capacity()).unwrap_or(usize::MAX)
    }

    fn read_blocks(&mut self, block_id: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let block_size = self.check_span(block_id, buf.len())?;
        for (i, chunk) in buf.chunks_exact_mut(block_size).enumerate() {
            self.read((block_id + i) as u64, chunk)?;
        }
        Ok(())
    }

    fn write_blocks(&mut self, block_id: usize, buf: &[u8]) -> Result<(), StorageError> {
        let block_size = self.check_span(block_id, buf.len())?;
        for (i, chunk) in buf.chunks_exact(block_size).enumerate() {
            self.write((block_id + i) as u64, chunk)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        match VirtioBlk::flush(self) {
            // Nothing to flush without a write cache
            Err(crate::error::BlockError::Unsupported) => Ok(()),
            other => other.map_err(StorageError::from),
        }
    }
}
