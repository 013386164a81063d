//! Split virtqueue memory layout.
//!
//! One allocation holds all three parts:
//!
//! ```text
//! 0            descriptor table   16 * N
//! 16N          available ring     flags, idx, ring[N], used_event
//! align4(..)   used ring          flags, idx, ring[N] (8 bytes each), avail_event
//! ```

use crate::queue::QueueError;

/// Largest queue the split ring format allows.
pub const MAX_QUEUE_SIZE: u16 = 32768;

const DESC_SIZE: usize = 16;
const RING_HEADER: usize = 4;
const AVAIL_ENTRY: usize = 2;
const USED_ENTRY: usize = 8;
const EVENT_FIELD: usize = 2;
const USED_ALIGN: usize = 4;

/// Byte offsets of every ring field for a given queue size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    size: u16,
    avail_offset: usize,
    used_offset: usize,
    total: usize,
}

impl QueueLayout {
    pub fn new(size: u16) -> Result<Self, QueueError> {
        if size == 0 || size > MAX_QUEUE_SIZE {
            return Err(QueueError::InvalidSize);
        }
        let n = usize::from(size);
        let avail_offset = DESC_SIZE * n;
        let avail_end = avail_offset + RING_HEADER + AVAIL_ENTRY * n + EVENT_FIELD;
        let used_offset = avail_end.next_multiple_of(USED_ALIGN);
        let total = used_offset + RING_HEADER + USED_ENTRY * n + EVENT_FIELD;
        Ok(Self {
            size,
            avail_offset,
            used_offset,
            total,
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Bytes the whole queue occupies.
    pub fn total_size(&self) -> usize {
        self.total
    }

    pub fn desc_offset(&self, index: u16) -> usize {
        DESC_SIZE * usize::from(index)
    }

    pub fn avail_offset(&self) -> usize {
        self.avail_offset
    }

    pub fn avail_idx_offset(&self) -> usize {
        self.avail_offset + 2
    }

    pub fn avail_ring_offset(&self, slot: u16) -> usize {
        self.avail_offset + RING_HEADER + AVAIL_ENTRY * usize::from(slot)
    }

    pub fn used_event_offset(&self) -> usize {
        self.avail_ring_offset(self.size)
    }

    pub fn used_offset(&self) -> usize {
        self.used_offset
    }

    pub fn used_idx_offset(&self) -> usize {
        self.used_offset + 2
    }

    pub fn used_ring_offset(&self, slot: u16) -> usize {
        self.used_offset + RING_HEADER + USED_ENTRY * usize::from(slot)
    }

    pub fn avail_event_offset(&self) -> usize {
        self.used_ring_offset(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests: offsets for queue size 16
    #[test]
    fn test_layout_size_16() {
        let layout = QueueLayout::new(16).unwrap();
        assert_eq!(layout.avail_offset(), 256);
        assert_eq!(layout.avail_idx_offset(), 258);
        assert_eq!(layout.avail_ring_offset(0), 260);
        assert_eq!(layout.used_event_offset(), 292);
        // 256 + 4 + 32 + 2 = 294, aligned up to 296
        assert_eq!(layout.used_offset(), 296);
        assert_eq!(layout.used_ring_offset(1), 308);
        assert_eq!(layout.avail_event_offset(), 428);
        assert_eq!(layout.total_size(), 430);
    }

    /// Tests: used ring is always 4-byte aligned
    #[test]
    fn test_used_alignment() {
        for size in [1u16, 3, 5, 7, 12, 255, 256, 1024, MAX_QUEUE_SIZE] {
            let layout = QueueLayout::new(size).unwrap();
            assert_eq!(layout.used_offset() % 4, 0, "size {size}");
            assert!(layout.used_offset() >= layout.used_event_offset() + 2);
        }
    }

    /// Tests: zero and oversized queues are rejected
    #[test]
    fn test_invalid_sizes() {
        assert_eq!(QueueLayout::new(0), Err(QueueError::InvalidSize));
        assert_eq!(QueueLayout::new(MAX_QUEUE_SIZE + 1), Err(QueueError::InvalidSize));
    }
}
