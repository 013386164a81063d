// Shared fixture: a virtio block device that serves requests from a RAM disk.
// The driver sees it only through register reads and writes plus the rings.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use los_virtio::testing::{FakeRegisters, RingView};
use los_virtio::{Descriptor, DeviceStatus, InterruptStatus, RegisterPort, regs};
use virtio_blk::{BlkFeatures, RequestType, SECTOR_SIZE};
use virtio_blk::protocol::status;

pub const DEVICE_ID_BLOCK: u32 = 2;

/// When the device answers a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Serve every available chain as soon as it is notified.
    Immediate,
    /// Park chains until `complete_held` is called.
    Deferred,
}

struct State {
    regs: FakeRegisters,
    disk: Vec<u8>,
    ring: Option<RingView>,
    mode: Completion,
    held: VecDeque<u16>,
    failing_sectors: Vec<u64>,
    leave_status_unset: bool,
    flushes: usize,
}

/// Cloneable handle; every clone drives the same device.
#[derive(Clone)]
pub struct FakeBlockDevice {
    state: Arc<Mutex<State>>,
}

impl FakeBlockDevice {
    /// A device with `sectors` 512-byte sectors offering VERSION_1 and FLUSH.
    pub fn new(sectors: u64) -> Self {
        Self::with_device_id(sectors, DEVICE_ID_BLOCK)
    }

    /// Same, but reporting `device_id` in the identification registers.
    pub fn with_device_id(sectors: u64, device_id: u32) -> Self {
        let mut regs = FakeRegisters::new(device_id);
        regs.set_device_features((BlkFeatures::VERSION_1 | BlkFeatures::FLUSH).bits());
        regs.set_config(0, &sectors.to_le_bytes());
        let disk = vec![0u8; (sectors * u64::from(SECTOR_SIZE)) as usize];
        Self {
            state: Arc::new(Mutex::new(State {
                regs,
                disk,
                ring: None,
                mode: Completion::Immediate,
                held: VecDeque::new(),
                failing_sectors: Vec::new(),
                leave_status_unset: false,
                flushes: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Poke at the register file before or after the driver runs.
    pub fn with_regs<R>(&self, f: impl FnOnce(&mut FakeRegisters) -> R) -> R {
        f(&mut self.lock().regs)
    }

    pub fn set_features(&self, features: BlkFeatures) {
        self.with_regs(|regs| regs.set_device_features(features.bits()));
    }

    /// Advertise a logical block size (the driver only uses it with BLK_SIZE).
    pub fn set_blk_size(&self, size: u32) {
        self.with_regs(|regs| regs.set_config(20, &size.to_le_bytes()));
    }

    pub fn set_capacity(&self, sectors: u64) {
        self.with_regs(|regs| regs.set_config(0, &sectors.to_le_bytes()));
    }

    pub fn set_mode(&self, mode: Completion) {
        self.lock().mode = mode;
    }

    /// Answer IOERR for requests starting at `sector`.
    pub fn fail_sector(&self, sector: u64) {
        self.lock().failing_sectors.push(sector);
    }

    /// Complete requests without writing the status byte.
    pub fn leave_status_unset(&self, leave: bool) {
        self.lock().leave_status_unset = leave;
    }

    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Serve up to `count` parked chains in arrival order.
    pub fn complete_held(&self, count: usize) -> usize {
        let mut state = self.lock();
        let mut served = 0;
        while served < count {
            let Some(head) = state.held.pop_front() else {
                break;
            };
            state.serve(head);
            served += 1;
        }
        served
    }

    /// Put an entry on the used ring for a head the driver never submitted.
    pub fn push_bogus_used(&self, id: u32) {
        let mut state = self.lock();
        if let Some(ring) = state.ring.as_mut() {
            ring.push_used(id, 0);
        }
        state.regs.raise_interrupt(InterruptStatus::USED_BUFFER);
    }

    /// Move the used index to `idx` without writing any entries.
    pub fn set_used_idx(&self, idx: u16) {
        let mut state = self.lock();
        if let Some(ring) = state.ring.as_mut() {
            ring.set_used_idx(idx);
        }
        state.regs.raise_interrupt(InterruptStatus::USED_BUFFER);
    }

    pub fn disk(&self, offset: usize, len: usize) -> Vec<u8> {
        self.lock().disk[offset..offset + len].to_vec()
    }

    pub fn fill_disk(&self, offset: usize, data: &[u8]) {
        self.lock().disk[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    pub fn status(&self) -> DeviceStatus {
        self.lock().regs.status()
    }

    pub fn notifications(&self) -> usize {
        self.lock().regs.notifications().len()
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.lock().regs.writes().to_vec()
    }
}

impl State {
    fn on_notify(&mut self) {
        loop {
            let Some(head) = self.ring.as_mut().and_then(RingView::pop_avail) else {
                break;
            };
            match self.mode {
                Completion::Immediate => self.serve(head),
                Completion::Deferred => self.held.push_back(head),
            }
        }
    }

    fn serve(&mut self, head: u16) {
        let Some(ring) = self.ring.as_mut() else {
            return;
        };
        let chain = ring.chain(head);
        let (Some(header), Some(status_desc)) = (chain.first(), chain.last()) else {
            return;
        };

        let mut bytes = [0u8; 16];
        ring.read_buffer(header, 0, &mut bytes);
        let kind = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let sector = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let data: Option<&Descriptor> = if chain.len() == 3 { chain.get(1) } else { None };

        let mut written = 0u32;
        let outcome = if kind == RequestType::In as u32 {
            match (data, span(self.disk.len(), sector, data)) {
                (Some(desc), Some(range)) if !self.failing_sectors.contains(&sector) => {
                    ring.write_buffer(desc, 0, &self.disk[range]);
                    written = desc.len;
                    status::OK
                }
                _ => status::IOERR,
            }
        } else if kind == RequestType::Out as u32 {
            match (data, span(self.disk.len(), sector, data)) {
                (Some(desc), Some(range)) if !self.failing_sectors.contains(&sector) => {
                    ring.read_buffer(desc, 0, &mut self.disk[range]);
                    status::OK
                }
                _ => status::IOERR,
            }
        } else if kind == RequestType::Flush as u32 {
            self.flushes += 1;
            status::OK
        } else if kind == RequestType::GetSize as u32 {
            let sectors = (self.disk.len() / SECTOR_SIZE as usize) as u64;
            if let Some(desc) = data {
                ring.write_buffer(desc, 0, &sectors.to_le_bytes());
                written = 8;
            }
            status::OK
        } else {
            status::UNSUPP
        };

        if !self.leave_status_unset {
            ring.write_buffer(status_desc, 0, &[outcome]);
        }
        ring.push_used(u32::from(head), written + 1);
        self.regs.raise_interrupt(InterruptStatus::USED_BUFFER);
    }
}

/// Disk byte range a data descriptor at `sector` covers, if it fits.
fn span(disk_len: usize, sector: u64, data: Option<&Descriptor>) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(sector).ok()? * SECTOR_SIZE as usize;
    let end = start + data?.len as usize;
    (end <= disk_len).then_some(start..end)
}

impl RegisterPort for FakeBlockDevice {
    fn read(&self, offset: usize) -> u32 {
        self.lock().regs.read(offset)
    }

    fn write(&mut self, offset: usize, value: u32) {
        let mut state = self.lock();
        state.regs.write(offset, value);
        match offset {
            regs::STATUS if value == 0 => {
                state.ring = None;
                state.held.clear();
            }
            regs::STATUS if value & DeviceStatus::DRIVER_OK.bits() != 0 && state.ring.is_none() => {
                let paddr = state.regs.queue_address();
                let size = state.regs.queue_size();
                // SAFETY: StdHal memory is identity mapped and the driver
                // keeps the queue alive until it resets the device.
                state.ring = unsafe { RingView::new(paddr, size) }.ok();
            }
            regs::QUEUE_NOTIFY => state.on_notify(),
            _ => {}
        }
    }
}
