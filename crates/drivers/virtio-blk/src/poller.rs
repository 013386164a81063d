//! Completion poller and pending-request table.
//!
//! TEAM_452: Adapted from the GPU driver's `PendingCommand`: one slot per
//! possible chain head, each with a state, an optional waker and a landing
//! buffer the read data is copied into before the chain is released.

use alloc::vec;
use alloc::vec::Vec;
use core::task::Waker;

use los_virtio::{QueueError, UsedElement, VirtQueue, VirtioHal};

use crate::error::BlockError;
use crate::protocol::{RequestType, status};
use crate::request::ChainSlots;

/// Counters the kernel can read for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverTelemetry {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub timed_out: u64,
    pub protocol_errors: u64,
    /// Completions of abandoned requests that were thrown away.
    pub discarded: u64,
}

/// Handle for a submitted request.
///
/// The serial number keeps a stale token from matching a later request
/// that reuses the same chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestToken {
    head: u16,
    serial: u32,
}

impl RequestToken {
    pub fn head(&self) -> u16 {
        self.head
    }
}

/// State of a pending-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InFlight { kind: RequestType, abandoned: bool },
    Done(Result<usize, BlockError>),
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    serial: u32,
    len: usize,
    landing: Vec<u8>,
    waker: Option<Waker>,
}

impl Slot {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Requests between submission and the caller collecting the result.
#[derive(Debug)]
pub struct PendingTable {
    slots: Vec<Slot>,
    next_serial: u32,
}

impl PendingTable {
    /// Table for a queue of `capacity` entries with `buffer_size` landing bytes each.
    pub fn new(capacity: u16, buffer_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                state: SlotState::Free,
                serial: 0,
                len: 0,
                landing: vec![0; buffer_size],
                waker: None,
            })
            .collect();
        Self {
            slots,
            next_serial: 1,
        }
    }

    /// Number of requests the device still owes us.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::InFlight { .. }))
            .count()
    }

    pub(crate) fn insert(&mut self, head: u16, kind: RequestType, len: usize) -> RequestToken {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        if let Some(slot) = self.slots.get_mut(usize::from(head)) {
            debug_assert!(slot.state == SlotState::Free, "head {head} reused while busy");
            slot.state = SlotState::InFlight {
                kind,
                abandoned: false,
            };
            slot.serial = serial;
            slot.len = len;
            slot.waker = None;
        }
        RequestToken { head, serial }
    }

    fn slot_for(&mut self, token: RequestToken) -> Result<&mut Slot, BlockError> {
        match self.slots.get_mut(usize::from(token.head)) {
            Some(slot) if slot.serial == token.serial && slot.state != SlotState::Free => Ok(slot),
            _ => Err(BlockError::UnknownRequest),
        }
    }

    /// Collect a finished request.
    ///
    /// `Ok(None)` while in flight. On success returned data is copied into
    /// `out` (up to its length) and the byte count of the request returned.
    pub fn take(
        &mut self,
        token: RequestToken,
        out: &mut [u8],
    ) -> Result<Option<usize>, BlockError> {
        let slot = self.slot_for(token)?;
        let SlotState::Done(result) = slot.state else {
            return Ok(None);
        };
        slot.state = SlotState::Free;
        slot.waker = None;
        let len = result?;
        let n = len.min(out.len()).min(slot.landing.len());
        out[..n].copy_from_slice(&slot.landing[..n]);
        Ok(Some(len))
    }

    /// Wake `waker` when the request completes.
    pub fn register_waker(&mut self, token: RequestToken, waker: &Waker) -> Result<(), BlockError> {
        let slot = self.slot_for(token)?;
        match &slot.waker {
            Some(existing) if existing.will_wake(waker) => {}
            _ => slot.waker = Some(waker.clone()),
        }
        Ok(())
    }

    /// Give up on a request. Its completion will be discarded.
    pub fn abandon(&mut self, token: RequestToken) {
        if let Ok(slot) = self.slot_for(token) {
            match slot.state {
                SlotState::InFlight { kind, .. } => {
                    slot.state = SlotState::InFlight {
                        kind,
                        abandoned: true,
                    };
                    slot.waker = None;
                }
                SlotState::Done(_) => slot.state = SlotState::Free,
                SlotState::Free => {}
            }
        }
    }

    /// Fail every in-flight request, e.g. after the device was reset.
    pub fn cancel_all(&mut self, err: BlockError) {
        for slot in &mut self.slots {
            match slot.state {
                SlotState::InFlight {
                    abandoned: true, ..
                } => slot.state = SlotState::Free,
                SlotState::InFlight { .. } => {
                    slot.state = SlotState::Done(Err(err));
                    slot.wake();
                }
                SlotState::Free | SlotState::Done(_) => {}
            }
        }
    }
}

/// Map a device status byte.
pub fn map_status(byte: u8) -> Result<(), BlockError> {
    match byte {
        status::OK => Ok(()),
        status::IOERR => Err(BlockError::IoError),
        status::UNSUPP => Err(BlockError::Unsupported),
        _ => Err(BlockError::ProtocolError),
    }
}

/// Resolve every completion the device has published so far.
///
/// Returns the number of requests resolved (including discarded ones), or
/// the queue error when the used index itself cannot be trusted.
pub(crate) fn drain<H: VirtioHal>(
    queue: &mut VirtQueue<H>,
    pending: &mut PendingTable,
    telemetry: &mut DriverTelemetry,
) -> Result<usize, QueueError> {
    let mut resolved = 0;
    let mut used = queue.poll_used()?;
    while let Some(element) = used.next() {
        if resolve(used.queue_mut(), pending, telemetry, element) {
            resolved += 1;
        }
    }
    Ok(resolved)
}

fn resolve<H: VirtioHal>(
    queue: &mut VirtQueue<H>,
    pending: &mut PendingTable,
    telemetry: &mut DriverTelemetry,
    element: UsedElement,
) -> bool {
    let slot = u16::try_from(element.id)
        .ok()
        .and_then(|head| pending.slots.get_mut(usize::from(head)).map(|slot| (head, slot)));
    let Some((head, slot)) = slot else {
        log::error!("[VIRTIO-BLK] Used entry for out-of-range head {}", element.id);
        telemetry.protocol_errors += 1;
        return false;
    };
    let SlotState::InFlight { kind, abandoned } = slot.state else {
        log::error!("[VIRTIO-BLK] Used entry for head {head} which is not in flight");
        telemetry.protocol_errors += 1;
        return false;
    };

    let result = complete(queue, head, kind, slot);

    if let Err(err) = queue.release_descriptor_chain(head) {
        log::error!("[VIRTIO-BLK] Releasing chain {head} failed: {err}");
        telemetry.protocol_errors += 1;
    }

    if abandoned {
        log::debug!("[VIRTIO-BLK] Discarding late completion of head {head}");
        slot.state = SlotState::Free;
        telemetry.discarded += 1;
        return true;
    }

    match result {
        Ok(_) => telemetry.completed += 1,
        Err(BlockError::ProtocolError) => {
            telemetry.protocol_errors += 1;
            telemetry.failed += 1;
        }
        Err(_) => telemetry.failed += 1,
    }
    log::trace!("[VIRTIO-BLK] Head {head} completed: {result:?}");
    slot.state = SlotState::Done(result);
    slot.wake();
    true
}

/// Read the status byte and copy returned data into the landing buffer.
fn complete<H: VirtioHal>(
    queue: &VirtQueue<H>,
    head: u16,
    kind: RequestType,
    slot: &mut Slot,
) -> Result<usize, BlockError> {
    let slots = ChainSlots::of(queue, head)?;
    let byte = queue
        .buffer(slots.status)?
        .read_u8(0)
        .ok_or(BlockError::ProtocolError)?;
    if let Err(err) = map_status(byte) {
        if err == BlockError::ProtocolError {
            log::warn!("[VIRTIO-BLK] Head {head} completed with status {byte:#x}");
        }
        return Err(err);
    }

    if matches!(kind, RequestType::In | RequestType::GetSize) {
        let data = slots.data.ok_or(BlockError::ProtocolError)?;
        let len = slot.len.min(slot.landing.len());
        if !queue.buffer(data)?.read_bytes(0, &mut slot.landing[..len]) {
            return Err(BlockError::ProtocolError);
        }
    }
    Ok(slot.len)
}
