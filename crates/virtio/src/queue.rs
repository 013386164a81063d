//! VirtQueue implementation for VirtIO devices.
//!
//! TEAM_098: Created as part of VirtIO GPU refactor.
//! TEAM_109: Added event fields, padding, volatile writes, DSB barrier.
//! TEAM_452: Ring memory now lives in a single HAL allocation addressed
//!           through [`QueueLayout`] instead of an embedded struct, and each
//!           descriptor owns a permanent DMA buffer.
//!
//! This module provides a split virtqueue per VirtIO 1.1 spec section 2.6.
//!
//! Free descriptors are kept as a singly linked list threaded through the
//! `next` field of the descriptor table. Acquiring a chain pops `n` entries
//! off the front and releasing pushes the chain back. Only the driver ever
//! touches free descriptors, so the list survives in device-visible memory.

use alloc::vec::Vec;

use bitflags::bitflags;
use los_error::define_kernel_error;

use crate::barrier;
use crate::hal::{BufferDirection, DmaBuffer, PAGE_SIZE, VirtioHal};
use crate::layout::QueueLayout;

define_kernel_error! {
    /// Errors from virtqueue bookkeeping.
    pub enum QueueError(0x0C) {
        /// HAL could not provide ring or buffer memory
        OutOfMemory = 0x01 => "DMA allocation failed" [transient],
        /// Fewer free descriptors than the chain needs
        NoFreeDescriptors = 0x02 => "Not enough free descriptors" [transient],
        /// Zero or oversized queue, chain or buffer length
        InvalidSize = 0x03 => "Invalid queue or buffer size",
        /// Index past the end of the descriptor table
        InvalidDescriptor = 0x04 => "Descriptor index out of range",
        /// Chain flags or links disagree with what was acquired
        CorruptChain = 0x05 => "Descriptor chain is malformed",
        /// Index is not the head of a chain the driver owns
        NotChainHead = 0x06 => "Descriptor is not an owned chain head",
        /// Device moved the used index further than the queue holds
        MalformedRing = 0x07 => "Used index out of range",
    }
}

bitflags! {
    /// Descriptor flags per VirtIO 1.1 spec section 2.6.5.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u16 {
        /// Buffer continues via the next field.
        const NEXT = 1;
        /// Buffer is device write-only (otherwise read-only).
        const WRITE = 2;
        /// Buffer contains a list of buffer descriptors.
        const INDIRECT = 4;
    }
}

/// A single descriptor in the descriptor table.
///
/// Per VirtIO 1.1 spec section 2.6.5.
// TEAM_106: align(16) per VirtIO 1.1 spec section 2.6 requirement.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Descriptor flags.
    pub flags: u16,
    /// Next descriptor index if NEXT flag is set.
    pub next: u16,
}

impl Descriptor {
    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_retain(self.flags)
    }
}

const _: () = assert!(core::mem::size_of::<Descriptor>() == 16);

/// Used ring entry as the device writes it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct UsedRingEntry {
    id: u32,
    len: u32,
}

/// A completion taken off the used ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedElement {
    /// Head descriptor index as reported by the device. Not yet validated.
    pub id: u32,
    /// Bytes the device wrote into the chain's writable buffers.
    pub len: u32,
}

/// A split virtqueue backed by HAL memory.
pub struct VirtQueue<H: VirtioHal> {
    layout: QueueLayout,
    ring: DmaBuffer<H>,
    /// One buffer per descriptor; `Descriptor::addr` points at it for life.
    buffers: Vec<DmaBuffer<H>>,
    buffer_size: usize,
    /// Chain length for owned heads, zero everywhere else.
    chain_len: Vec<u16>,
    /// Free descriptor head (local driver state).
    free_head: u16,
    /// Number of free descriptors.
    num_free: u16,
    /// Shadow of the available index we last published.
    avail_idx: u16,
    /// Last seen used index.
    last_used_idx: u16,
}

impl<H: VirtioHal> VirtQueue<H> {
    /// Allocate ring memory and per-descriptor buffers of `buffer_size` bytes.
    ///
    /// Any allocation failure releases everything obtained so far and
    /// returns [`QueueError::OutOfMemory`].
    pub fn allocate(size: u16, buffer_size: usize) -> Result<Self, QueueError> {
        let layout = QueueLayout::new(size)?;
        if buffer_size == 0 || u32::try_from(buffer_size).is_err() {
            return Err(QueueError::InvalidSize);
        }

        let ring = DmaBuffer::new(layout.total_size(), PAGE_SIZE, BufferDirection::Both)
            .ok_or_else(|| {
                log::warn!("[VIRTQ] Ring allocation of {} bytes failed", layout.total_size());
                QueueError::OutOfMemory
            })?;

        let mut buffers = Vec::with_capacity(usize::from(size));
        for index in 0..size {
            let buffer = DmaBuffer::new(buffer_size, 16, BufferDirection::Both).ok_or_else(|| {
                log::warn!("[VIRTQ] Buffer {index} allocation failed");
                QueueError::OutOfMemory
            })?;
            buffers.push(buffer);
        }

        let mut queue = Self {
            layout,
            ring,
            buffers,
            buffer_size,
            chain_len: alloc::vec![0; usize::from(size)],
            free_head: 0,
            num_free: size,
            avail_idx: 0,
            last_used_idx: 0,
        };
        queue.init()?;
        log::debug!(
            "[VIRTQ] Allocated queue of {size} at {:#x} ({} bytes)",
            queue.ring.paddr(),
            layout.total_size()
        );
        Ok(queue)
    }

    /// Point every descriptor at its buffer, link the free list and zero the rings.
    fn init(&mut self) -> Result<(), QueueError> {
        let size = self.layout.size();
        for index in 0..size {
            let desc = Descriptor {
                addr: self.buffers[usize::from(index)].paddr(),
                len: 0,
                flags: 0,
                next: (index + 1) % size,
            };
            self.write_desc(index, desc)?;
        }
        self.write_u16(self.layout.avail_offset(), 0);
        self.write_u16(self.layout.avail_idx_offset(), 0);
        self.write_u16(self.layout.used_offset(), 0);
        self.write_u16(self.layout.used_idx_offset(), 0);
        self.free_head = 0;
        self.num_free = size;
        Ok(())
    }

    pub fn size(&self) -> u16 {
        self.layout.size()
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    /// Physical base of the queue (descriptor table).
    pub fn paddr(&self) -> u64 {
        self.ring.paddr()
    }

    pub fn used_paddr(&self) -> u64 {
        self.ring.paddr() + self.layout.used_offset() as u64
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Available index as last published.
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    /// Take `n` descriptors off the free list, linked with NEXT.
    ///
    /// Returns the head index. The chain is owned by the caller until
    /// [`release_descriptor_chain`](Self::release_descriptor_chain).
    pub fn acquire_descriptor_chain(&mut self, n: u16) -> Result<u16, QueueError> {
        if n == 0 || n > self.size() {
            return Err(QueueError::InvalidSize);
        }
        if n > self.num_free {
            return Err(QueueError::NoFreeDescriptors);
        }

        let head = self.free_head;
        let mut index = head;
        for i in 0..n {
            let mut desc = self.read_desc(index)?;
            let next = desc.next;
            let last = i + 1 == n;
            desc.len = 0;
            desc.flags = if last { 0 } else { DescriptorFlags::NEXT.bits() };
            self.write_desc(index, desc)?;
            if last {
                self.free_head = next;
            } else {
                index = next;
            }
        }

        self.num_free -= n;
        self.chain_len[usize::from(head)] = n;
        Ok(head)
    }

    /// Indices of an owned chain, head first.
    pub fn chain(&self, head: u16) -> Result<ChainIter<'_, H>, QueueError> {
        let remaining = self.owned_chain_len(head)?;
        Ok(ChainIter {
            queue: self,
            next: Some(head),
            remaining,
        })
    }

    /// Set length and direction of one descriptor, keeping its link.
    pub fn configure_descriptor(
        &mut self,
        index: u16,
        len: u32,
        device_writable: bool,
    ) -> Result<(), QueueError> {
        if len as usize > self.buffer_size {
            return Err(QueueError::InvalidSize);
        }
        let mut desc = self.read_desc(index)?;
        let mut flags = desc.flags() & DescriptorFlags::NEXT;
        flags.set(DescriptorFlags::WRITE, device_writable);
        desc.len = len;
        desc.flags = flags.bits();
        self.write_desc(index, desc)
    }

    pub fn descriptor(&self, index: u16) -> Result<Descriptor, QueueError> {
        self.read_desc(index)
    }

    /// The DMA buffer a descriptor points at.
    pub fn buffer(&self, index: u16) -> Result<&DmaBuffer<H>, QueueError> {
        self.buffers
            .get(usize::from(index))
            .ok_or(QueueError::InvalidDescriptor)
    }

    pub fn buffer_mut(&mut self, index: u16) -> Result<&mut DmaBuffer<H>, QueueError> {
        self.buffers
            .get_mut(usize::from(index))
            .ok_or(QueueError::InvalidDescriptor)
    }

    /// Put an owned chain on the available ring.
    ///
    /// The ring slot is written first, then a barrier, then the index. The
    /// caller notifies the device afterwards.
    pub fn publish(&mut self, head: u16) -> Result<(), QueueError> {
        self.owned_chain_len(head)?;

        let slot = self.avail_idx % self.size();
        self.write_u16(self.layout.avail_ring_offset(slot), head);

        // Descriptor and ring slot must land before the index moves
        barrier::publish();

        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.write_u16(self.layout.avail_idx_offset(), self.avail_idx);

        // And the index before the notify that follows
        barrier::publish();
        Ok(())
    }

    /// Volatile read of the device's used index.
    pub fn used_idx(&self) -> u16 {
        self.ring
            .field::<u16>(self.layout.used_idx_offset())
            .map_or(self.last_used_idx, |ptr| ptr.read())
    }

    /// Snapshot the used index and iterate completions up to it.
    ///
    /// Dropping the iterator early is fine; the next call resumes where
    /// this one stopped. More than `size` new entries is
    /// [`QueueError::MalformedRing`] and nothing is consumed.
    pub fn poll_used(&mut self) -> Result<UsedIter<'_, H>, QueueError> {
        let end = self.used_idx();
        let pending = end.wrapping_sub(self.last_used_idx);
        if pending > self.size() {
            log::error!(
                "[VIRTQ] Used index {end} is {pending} past {} on a queue of {}",
                self.last_used_idx,
                self.size()
            );
            return Err(QueueError::MalformedRing);
        }
        barrier::consume();
        Ok(UsedIter { queue: self, end })
    }

    fn next_used(&mut self, end: u16) -> Option<UsedElement> {
        if self.last_used_idx == end {
            return None;
        }
        let slot = self.last_used_idx % self.size();
        let entry = self
            .ring
            .field::<UsedRingEntry>(self.layout.used_ring_offset(slot))?
            .read();
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        Some(UsedElement {
            id: entry.id,
            len: entry.len,
        })
    }

    /// Return an owned chain to the free list.
    ///
    /// The walk is bounded by the length recorded at acquire time, so a
    /// corrupted `next` link can't loop. Returns the number of descriptors freed.
    pub fn release_descriptor_chain(&mut self, head: u16) -> Result<u16, QueueError> {
        let n = self.owned_chain_len(head)?;

        let mut index = head;
        for i in 0..n {
            let desc = self.read_desc(index)?;
            let has_next = desc.flags().contains(DescriptorFlags::NEXT);
            let last = i + 1 == n;
            if last == has_next {
                log::error!("[VIRTQ] Chain at {head} broken at {index}");
                return Err(QueueError::CorruptChain);
            }
            if !last {
                if desc.next >= self.size() {
                    return Err(QueueError::CorruptChain);
                }
                index = desc.next;
            }
        }

        // Splice the chain onto the front of the free list
        let mut tail = self.read_desc(index)?;
        tail.next = if self.num_free == 0 { head } else { self.free_head };
        self.write_desc(index, tail)?;
        self.free_head = head;
        self.num_free += n;
        self.chain_len[usize::from(head)] = 0;
        Ok(n)
    }

    fn owned_chain_len(&self, head: u16) -> Result<u16, QueueError> {
        match self.chain_len.get(usize::from(head)) {
            None => Err(QueueError::InvalidDescriptor),
            Some(0) => Err(QueueError::NotChainHead),
            Some(&n) => Ok(n),
        }
    }

    fn read_desc(&self, index: u16) -> Result<Descriptor, QueueError> {
        if index >= self.size() {
            return Err(QueueError::InvalidDescriptor);
        }
        self.ring
            .field::<Descriptor>(self.layout.desc_offset(index))
            .map(|ptr| ptr.read())
            .ok_or(QueueError::InvalidDescriptor)
    }

    fn write_desc(&mut self, index: u16, desc: Descriptor) -> Result<(), QueueError> {
        if index >= self.size() {
            return Err(QueueError::InvalidDescriptor);
        }
        self.ring
            .field::<Descriptor>(self.layout.desc_offset(index))
            .map(|ptr| ptr.write(desc))
            .ok_or(QueueError::InvalidDescriptor)
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        let ptr = self.ring.field::<u16>(offset);
        debug_assert!(ptr.is_some(), "ring offset {offset:#x} outside layout");
        if let Some(ptr) = ptr {
            ptr.write(value);
        }
    }
}

impl<H: VirtioHal> core::fmt::Debug for VirtQueue<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtQueue")
            .field("size", &self.size())
            .field("paddr", &format_args!("{:#x}", self.paddr()))
            .field("num_free", &self.num_free)
            .field("avail_idx", &self.avail_idx)
            .field("last_used_idx", &self.last_used_idx)
            .finish_non_exhaustive()
    }
}

/// Descriptor indices of one chain.
pub struct ChainIter<'a, H: VirtioHal> {
    queue: &'a VirtQueue<H>,
    next: Option<u16>,
    remaining: u16,
}

impl<H: VirtioHal> Iterator for ChainIter<'_, H> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.next?;
        self.remaining -= 1;
        self.next = match self.queue.read_desc(index) {
            Ok(desc) if desc.flags().contains(DescriptorFlags::NEXT) => Some(desc.next),
            _ => None,
        };
        Some(index)
    }
}

/// Completions between the last consumed used index and a snapshot.
pub struct UsedIter<'a, H: VirtioHal> {
    queue: &'a mut VirtQueue<H>,
    end: u16,
}

impl<H: VirtioHal> UsedIter<'_, H> {
    /// The queue, for releasing chains between completions.
    pub fn queue_mut(&mut self) -> &mut VirtQueue<H> {
        self.queue
    }
}

impl<H: VirtioHal> Iterator for UsedIter<'_, H> {
    type Item = UsedElement;

    fn next(&mut self) -> Option<UsedElement> {
        self.queue.next_used(self.end)
    }
}
