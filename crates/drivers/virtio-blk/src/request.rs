//! Request builder.
//!
//! Turns a [`BlockRequest`] into a descriptor chain:
//!
//! ```text
//! READ / WRITE / GET_SIZE:  header (R) -> data (R for write, W otherwise) -> status (W)
//! FLUSH:                    header (R) -> status (W)
//! ```
//!
//! Descriptor buffers are the queue's permanent per-slot buffers, so
//! building a request copies into DMA memory but never allocates.

use los_virtio::{VirtQueue, VirtioHal};

use crate::error::BlockError;
use crate::protocol::{RequestHeader, RequestType, status};

/// Bytes the device writes for a GET_SIZE request.
pub const GET_SIZE_LEN: usize = 8;

/// One logical block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    kind: RequestType,
    /// Device sector (always 512-byte units).
    sector: u64,
    /// Bytes of data moved, zero for flush.
    len: usize,
}

impl BlockRequest {
    pub fn read(sector: u64, len: usize) -> Self {
        Self {
            kind: RequestType::In,
            sector,
            len,
        }
    }

    pub fn write(sector: u64, len: usize) -> Self {
        Self {
            kind: RequestType::Out,
            sector,
            len,
        }
    }

    pub fn flush() -> Self {
        Self {
            kind: RequestType::Flush,
            sector: 0,
            len: 0,
        }
    }

    pub fn get_size() -> Self {
        Self {
            kind: RequestType::GetSize,
            sector: 0,
            len: GET_SIZE_LEN,
        }
    }

    pub fn kind(&self) -> RequestType {
        self.kind
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the device modifies the medium.
    pub fn mutates(&self) -> bool {
        matches!(self.kind, RequestType::Out | RequestType::Flush)
    }

    /// Whether the device returns data into the data descriptor.
    pub fn returns_data(&self) -> bool {
        matches!(self.kind, RequestType::In | RequestType::GetSize)
    }

    pub fn has_data(&self) -> bool {
        !matches!(self.kind, RequestType::Flush)
    }

    pub(crate) fn descriptor_count(&self) -> u16 {
        if self.has_data() { 3 } else { 2 }
    }
}

/// Descriptor indices of a built chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainSlots {
    pub header: u16,
    pub data: Option<u16>,
    pub status: u16,
}

impl ChainSlots {
    /// Recover the slot layout of an owned chain from the queue.
    pub fn of<H: VirtioHal>(queue: &VirtQueue<H>, head: u16) -> Result<Self, BlockError> {
        let mut indices = [0u16; 3];
        let mut count = 0;
        for index in queue.chain(head)? {
            if count == indices.len() {
                return Err(BlockError::ProtocolError);
            }
            indices[count] = index;
            count += 1;
        }
        match count {
            2 => Ok(Self {
                header: indices[0],
                data: None,
                status: indices[1],
            }),
            3 => Ok(Self {
                header: indices[0],
                data: Some(indices[1]),
                status: indices[2],
            }),
            _ => Err(BlockError::ProtocolError),
        }
    }
}

/// Validate `request`, take descriptors and fill them in.
///
/// `data` is the payload for writes and ignored otherwise. On error no
/// descriptors remain taken.
pub(crate) fn build<H: VirtioHal>(
    queue: &mut VirtQueue<H>,
    request: &BlockRequest,
    data: &[u8],
) -> Result<u16, BlockError> {
    if request.has_data() {
        if request.len == 0 || request.len > queue.buffer_size() {
            return Err(BlockError::InvalidSize);
        }
        if request.kind == RequestType::Out && data.len() != request.len {
            return Err(BlockError::InvalidSize);
        }
    }

    let head = queue.acquire_descriptor_chain(request.descriptor_count())?;
    if let Err(err) = fill(queue, head, request, data) {
        // Give the slots back; the chain never reached the ring
        if let Err(release) = queue.release_descriptor_chain(head) {
            log::error!("[VIRTIO-BLK] Could not release unbuilt chain {head}: {release}");
        }
        return Err(err);
    }
    Ok(head)
}

fn fill<H: VirtioHal>(
    queue: &mut VirtQueue<H>,
    head: u16,
    request: &BlockRequest,
    data: &[u8],
) -> Result<(), BlockError> {
    let slots = ChainSlots::of(queue, head)?;

    let header = RequestHeader::new(request.kind, request.sector);
    if !queue.buffer_mut(slots.header)?.write_bytes(0, header.as_bytes()) {
        return Err(BlockError::InvalidSize);
    }
    queue.configure_descriptor(slots.header, header.as_bytes().len() as u32, false)?;

    if let Some(slot) = slots.data {
        let len = request.len as u32;
        if request.kind == RequestType::Out {
            if !queue.buffer_mut(slot)?.write_bytes(0, data) {
                return Err(BlockError::InvalidSize);
            }
            queue.configure_descriptor(slot, len, false)?;
        } else {
            queue.configure_descriptor(slot, len, true)?;
        }
    }

    queue.buffer_mut(slots.status)?.write_bytes(0, &[status::UNSET]);
    queue.configure_descriptor(slots.status, 1, true)?;
    Ok(())
}
