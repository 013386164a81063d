//! Block driver errors.
//!
//! TEAM_452: Moved out of the kernel's block module and widened to cover
//! the whole request path.

use los_error::define_kernel_error;
use los_virtio::{QueueError, TransportError};
use storage_device::StorageError;

define_kernel_error! {
    /// Block device errors (0x06xx)
    pub enum BlockError(0x06) {
        /// Magic or version mismatch at the base address
        DeviceNotFound = 0x01 => "VirtIO block device not found",
        /// Device id is not a block device (strict policy)
        UnexpectedDeviceType = 0x02 => "Device is not a block device",
        /// A handshake step was not confirmed by the device
        NegotiationFailed = 0x03 => "Device negotiation failed",
        /// DMA allocator exhausted
        OutOfMemory = 0x04 => "Out of DMA memory" [transient],
        /// Queue full; retry after completions drain
        NoFreeDescriptors = 0x05 => "No free descriptors" [transient],
        /// Device returned IOERR
        IoError = 0x06 => "Device reported I/O error",
        /// Device returned UNSUPP, or the feature was not negotiated
        Unsupported = 0x07 => "Operation not supported",
        /// Unexpected status byte or ring state
        ProtocolError = 0x08 => "Device protocol violation",
        /// No completion within the poll budget
        Timeout = 0x09 => "Request timed out",
        /// Zero-length or oversized buffer
        InvalidSize = 0x0A => "Invalid buffer size",
        /// Write or flush on a read-only device
        ReadOnly = 0x0B => "Device is read-only",
        /// Driver shut down or device failed
        NotReady = 0x0C => "Block device not ready",
        /// Token does not name a pending request
        UnknownRequest = 0x0D => "Request is not pending",
    }
}

impl From<TransportError> for BlockError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::DeviceNotFound | TransportError::UnsupportedVersion => {
                BlockError::DeviceNotFound
            }
            TransportError::UnexpectedDeviceType => BlockError::UnexpectedDeviceType,
            TransportError::ConfigUnstable => BlockError::ProtocolError,
            TransportError::StatusRejected
            | TransportError::FeaturesRejected
            | TransportError::QueueUnavailable
            | TransportError::QueueSetupFailed
            | TransportError::ResetTimeout
            | TransportError::OutOfOrder => BlockError::NegotiationFailed,
        }
    }
}

impl From<QueueError> for BlockError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::OutOfMemory => BlockError::OutOfMemory,
            QueueError::NoFreeDescriptors => BlockError::NoFreeDescriptors,
            QueueError::InvalidSize => BlockError::InvalidSize,
            QueueError::InvalidDescriptor
            | QueueError::CorruptChain
            | QueueError::NotChainHead
            | QueueError::MalformedRing => {
                BlockError::ProtocolError
            }
        }
    }
}

impl From<BlockError> for StorageError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::NotReady
            | BlockError::DeviceNotFound
            | BlockError::UnexpectedDeviceType
            | BlockError::NegotiationFailed => StorageError::NotReady,
            BlockError::OutOfMemory | BlockError::NoFreeDescriptors => StorageError::Busy,
            BlockError::Unsupported => StorageError::Unsupported,
            BlockError::Timeout => StorageError::Timeout,
            BlockError::InvalidSize => StorageError::BadBufferSize,
            BlockError::ReadOnly => StorageError::ReadOnly,
            BlockError::IoError | BlockError::ProtocolError | BlockError::UnknownRequest => {
                StorageError::Io
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests: handshake failures collapse to the block taxonomy
    #[test]
    fn test_transport_mapping() {
        assert_eq!(
            BlockError::from(TransportError::UnsupportedVersion),
            BlockError::DeviceNotFound
        );
        assert_eq!(
            BlockError::from(TransportError::FeaturesRejected),
            BlockError::NegotiationFailed
        );
        assert_eq!(
            BlockError::from(TransportError::ConfigUnstable),
            BlockError::ProtocolError
        );
    }

    /// Tests: queue errors keep their transient class
    #[test]
    fn test_queue_mapping() {
        let err = BlockError::from(QueueError::NoFreeDescriptors);
        assert_eq!(err, BlockError::NoFreeDescriptors);
        assert!(err.is_transient());
        assert!(!BlockError::from(QueueError::CorruptChain).is_transient());
    }

    /// Tests: codes sit in the block subsystem
    #[test]
    fn test_block_error_codes() {
        assert_eq!(BlockError::DeviceNotFound.code(), 0x0601);
        assert_eq!(BlockError::Timeout.code(), 0x0609);
        assert_eq!(StorageError::from(BlockError::NoFreeDescriptors), StorageError::Busy);
    }
}
