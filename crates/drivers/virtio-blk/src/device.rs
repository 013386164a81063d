//! VirtIO block device.
//!
//! TEAM_452: Replaces the kernel's `static BLOCK_DEVICE` plus the
//! virtio-drivers backend. The device is an explicit value built by a
//! successful handshake and torn down on drop.

use core::task::{Context, Poll};

use los_virtio::{
    DeviceHandshake, DeviceIdentity, DeviceStatus, DeviceType, HandshakeState, InterruptStatus,
    MmioTransport, RegisterPort, VirtQueue, VirtioHal,
};

use crate::config::DriverConfig;
use crate::error::BlockError;
use crate::poller::{self, DriverTelemetry, PendingTable, RequestToken};
use crate::protocol::{BlkFeatures, BlockConfig, RequestType, SECTOR_SIZE};
use crate::request::{self, BlockRequest};

/// Largest shift applied to the backoff spin count.
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Driver lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// DRIVER_OK reached; requests are accepted.
    Ready,
    /// Device reported FAILED or NEEDS_RESET.
    Failed,
    /// `shutdown` reset the device.
    Shutdown,
}

/// Static facts learned during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub identity: DeviceIdentity,
    pub features: BlkFeatures,
    pub config: BlockConfig,
    /// Logical block size in bytes.
    pub sector_size: u32,
    pub queue_size: u16,
    pub read_only: bool,
}

/// A virtio block device behind an MMIO register port.
pub struct VirtioBlk<H: VirtioHal, P: RegisterPort> {
    transport: MmioTransport<P>,
    handshake: DeviceHandshake,
    queue: VirtQueue<H>,
    pending: PendingTable,
    config: DriverConfig,
    info: DeviceInfo,
    state: DriverState,
    telemetry: DriverTelemetry,
}

impl<H: VirtioHal, P: RegisterPort> VirtioBlk<H, P> {
    /// Run the handshake and set up the request queue.
    ///
    /// Identification failures leave the device untouched. Anything later
    /// writes FAILED before returning.
    pub fn new(port: P, config: DriverConfig) -> Result<Self, BlockError> {
        let mut transport = MmioTransport::new(port);
        let mut handshake = DeviceHandshake::new(DeviceType::Block, config.device_type_policy);

        let identity = handshake.identify(&transport)?;
        log::info!(
            "[VIRTIO-BLK] Found device id {} version {} vendor {:#x}",
            identity.device_id,
            identity.version,
            identity.vendor_id
        );

        match Self::bring_up(&mut transport, &mut handshake, identity, config) {
            Ok((queue, pending, info)) => {
                log::info!(
                    "[VIRTIO-BLK] Ready: {} sectors of {} bytes, queue {}{}",
                    info.config.capacity,
                    info.sector_size,
                    info.queue_size,
                    if info.read_only { ", read-only" } else { "" }
                );
                Ok(Self {
                    transport,
                    handshake,
                    queue,
                    pending,
                    config,
                    info,
                    state: DriverState::Ready,
                    telemetry: DriverTelemetry::default(),
                })
            }
            Err(err) => {
                log::error!("[VIRTIO-BLK] Initialization failed: {err}");
                if handshake.state() != HandshakeState::Failed {
                    handshake.fail(&mut transport);
                }
                Err(err)
            }
        }
    }

    fn bring_up(
        transport: &mut MmioTransport<P>,
        handshake: &mut DeviceHandshake,
        identity: DeviceIdentity,
        config: DriverConfig,
    ) -> Result<(VirtQueue<H>, PendingTable, DeviceInfo), BlockError> {
        handshake.reset(transport)?;
        handshake.acknowledge(transport)?;
        log::debug!("[VIRTIO-BLK] Acknowledged");

        let negotiated = handshake.negotiate(transport, config.requested_features.bits())?;
        let features = BlkFeatures::from_bits_retain(negotiated);
        log::debug!("[VIRTIO-BLK] Negotiated {features:?}");

        let device_config = BlockConfig::read(transport)?;
        let sector_size = device_config.logical_block_size(features);

        let max = handshake.queue_max_size(transport, config.queue_index)?;
        let queue_size = max.min(config.max_queue_size);
        if queue_size == 0 {
            return Err(BlockError::NegotiationFailed);
        }

        let queue = VirtQueue::<H>::allocate(queue_size, sector_size as usize)?;
        let pending = PendingTable::new(queue_size, sector_size as usize);
        handshake.activate_queue(transport, queue_size, queue.paddr())?;
        log::debug!(
            "[VIRTIO-BLK] Queue {} size {queue_size} (device max {max}) at {:#x}",
            config.queue_index,
            queue.paddr()
        );

        handshake.finalize(transport)?;

        let info = DeviceInfo {
            identity,
            features,
            config: device_config,
            sector_size,
            queue_size,
            read_only: features.contains(BlkFeatures::RO),
        };
        Ok((queue, pending, info))
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == DriverState::Ready
    }

    pub fn telemetry(&self) -> &DriverTelemetry {
        &self.telemetry
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Descriptors not owned by an in-flight request.
    pub fn free_descriptors(&self) -> u16 {
        self.queue.num_free()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.in_flight()
    }

    /// Logical block size in bytes.
    pub fn sector_size(&self) -> u32 {
        self.info.sector_size
    }

    /// Capacity in logical blocks, as of the last config read.
    pub fn capacity(&self) -> u64 {
        self.info.config.capacity / self.sectors_per_block()
    }

    /// `(sector_count, sector_size)` read fresh from config space.
    pub fn get_info(&self) -> Result<(u64, u32), BlockError> {
        let capacity_512 = BlockConfig::read_capacity(&self.transport)?;
        Ok((capacity_512 / self.sectors_per_block(), self.info.sector_size))
    }

    /// 512-byte device sectors per logical block; at least one.
    fn sectors_per_block(&self) -> u64 {
        u64::from(self.info.sector_size / SECTOR_SIZE).max(1)
    }

    /// Device sector (512-byte units) of logical block `lba`.
    ///
    /// An `lba` whose sector does not fit in 64 bits is `InvalidSize`.
    pub(crate) fn device_sector(&self, lba: u64) -> Result<u64, BlockError> {
        lba.checked_mul(self.sectors_per_block())
            .ok_or(BlockError::InvalidSize)
    }

    /// Fail unless the driver and the device are both healthy.
    fn check_health(&mut self) -> Result<(), BlockError> {
        if self.state != DriverState::Ready {
            return Err(BlockError::NotReady);
        }
        let status = self.transport.read_status();
        if status.intersects(DeviceStatus::FAILED | DeviceStatus::DEVICE_NEEDS_RESET) {
            log::error!("[VIRTIO-BLK] Device status {:#x}, refusing requests", status.bits());
            self.state = DriverState::Failed;
            self.telemetry.protocol_errors += 1;
            return Err(BlockError::ProtocolError);
        }
        Ok(())
    }

    /// Build, publish and notify one request.
    ///
    /// `data` is the payload of a write and ignored otherwise. Never blocks;
    /// a full queue is [`BlockError::NoFreeDescriptors`].
    pub fn submit(&mut self, request: BlockRequest, data: &[u8]) -> Result<RequestToken, BlockError> {
        self.check_health()?;
        if request.mutates() && self.info.read_only {
            return Err(BlockError::ReadOnly);
        }
        if request.kind() == RequestType::Flush
            && !self.info.features.contains(BlkFeatures::FLUSH)
        {
            return Err(BlockError::Unsupported);
        }

        let head = request::build(&mut self.queue, &request, data)?;
        let token = self.pending.insert(head, request.kind(), request.len());
        self.queue.publish(head)?;
        self.transport.queue_notify(self.config.queue_index);
        self.telemetry.submitted += 1;
        log::trace!(
            "[VIRTIO-BLK] Submitted {:?} sector {} len {} head {head}",
            request.kind(),
            request.sector(),
            request.len()
        );
        Ok(token)
    }

    /// Resolve whatever the device has completed. Returns how many.
    ///
    /// A used index the device moved further than the queue size puts the
    /// driver in `Failed` and fails every in-flight request.
    pub fn poll(&mut self) -> usize {
        match poller::drain(&mut self.queue, &mut self.pending, &mut self.telemetry) {
            Ok(resolved) => resolved,
            Err(err) => {
                log::error!("[VIRTIO-BLK] Used ring unusable: {err}");
                self.telemetry.protocol_errors += 1;
                self.state = DriverState::Failed;
                self.pending.cancel_all(BlockError::ProtocolError);
                0
            }
        }
    }

    /// Collect a request's result without waiting; `Ok(None)` while in flight.
    pub fn take_completion(
        &mut self,
        token: RequestToken,
        out: &mut [u8],
    ) -> Result<Option<usize>, BlockError> {
        self.pending.take(token, out)
    }

    /// Future-style poll of one request.
    pub fn poll_request(
        &mut self,
        token: RequestToken,
        out: &mut [u8],
        cx: &mut Context<'_>,
    ) -> Poll<Result<usize, BlockError>> {
        self.poll();
        match self.pending.take(token, out) {
            Ok(Some(len)) => Poll::Ready(Ok(len)),
            Ok(None) => match self.pending.register_waker(token, cx.waker()) {
                Ok(()) => Poll::Pending,
                Err(err) => Poll::Ready(Err(err)),
            },
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    /// Give up on a request; its completion will be discarded.
    pub fn abandon(&mut self, token: RequestToken) {
        self.pending.abandon(token);
    }

    /// Interrupt entry: acknowledge and drain.
    pub fn handle_interrupt(&mut self) -> usize {
        let status = self.transport.interrupt_status();
        if status.is_empty() {
            return 0;
        }
        self.transport.ack_interrupt(status);

        if status.contains(InterruptStatus::CONFIG_CHANGE) {
            match BlockConfig::read(&self.transport) {
                Ok(config) => {
                    log::info!("[VIRTIO-BLK] Config changed, capacity {}", config.capacity);
                    self.info.config = config;
                }
                Err(err) => log::warn!("[VIRTIO-BLK] Config re-read failed: {err}"),
            }
        }
        if status.contains(InterruptStatus::USED_BUFFER) {
            self.poll()
        } else {
            0
        }
    }

    /// Submit, retrying with backoff while the queue is full.
    pub(crate) fn submit_with_backoff(
        &mut self,
        request: BlockRequest,
        data: &[u8],
    ) -> Result<RequestToken, BlockError> {
        let mut attempt = 0;
        loop {
            match self.submit(request, data) {
                Err(err) if err.is_transient() && attempt < self.config.admission_retries => {
                    self.note_retry();
                    if self.poll() == 0 {
                        backoff(self.config.backoff_spins, attempt);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        log::warn!("[VIRTIO-BLK] Queue saturated after {attempt} retries");
                    }
                    return Err(err);
                }
                ok => return ok,
            }
        }
    }

    /// Busy-poll one request until it completes or the budget runs out.
    pub fn wait(&mut self, token: RequestToken, out: &mut [u8]) -> Result<usize, BlockError> {
        for _ in 0..self.config.poll_budget {
            self.poll();
            if let Some(len) = self.pending.take(token, out)? {
                return Ok(len);
            }
            core::hint::spin_loop();
        }
        Err(self.expire(token))
    }

    /// Abandon a request that ran out of poll budget.
    pub(crate) fn expire(&mut self, token: RequestToken) -> BlockError {
        log::warn!("[VIRTIO-BLK] Request on head {} timed out", token.head());
        self.pending.abandon(token);
        self.telemetry.timed_out += 1;
        BlockError::Timeout
    }

    pub(crate) fn note_retry(&mut self) {
        self.telemetry.retried += 1;
    }

    /// Read logical block `lba` into `buf` (at most one block).
    pub fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<usize, BlockError> {
        let request = BlockRequest::read(self.device_sector(lba)?, buf.len());
        let token = self.submit_with_backoff(request, &[])?;
        self.wait(token, buf)
    }

    /// Write `data` (at most one block) to logical block `lba`.
    pub fn write(&mut self, lba: u64, data: &[u8]) -> Result<usize, BlockError> {
        let request = BlockRequest::write(self.device_sector(lba)?, data.len());
        let token = self.submit_with_backoff(request, data)?;
        self.wait(token, &mut [])
    }

    /// Ask the device to persist its write cache.
    pub fn flush(&mut self) -> Result<(), BlockError> {
        let token = self.submit_with_backoff(BlockRequest::flush(), &[])?;
        self.wait(token, &mut []).map(|_| ())
    }

    /// Capacity in 512-byte sectors as answered by a GET_SIZE request.
    pub fn get_capacity(&mut self) -> Result<u64, BlockError> {
        let token = self.submit_with_backoff(BlockRequest::get_size(), &[])?;
        let mut bytes = [0u8; request::GET_SIZE_LEN];
        self.wait(token, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Reset the device. In-flight requests fail with `NotReady`.
    pub fn shutdown(&mut self) -> Result<(), BlockError> {
        if self.state == DriverState::Shutdown {
            return Ok(());
        }
        self.state = DriverState::Shutdown;
        self.pending.cancel_all(BlockError::NotReady);
        self.transport.disable_queue();
        if let Err(err) = self.handshake.reset(&mut self.transport) {
            log::error!("[VIRTIO-BLK] Reset on shutdown not confirmed: {err}");
            self.telemetry.protocol_errors += 1;
            return Err(BlockError::ProtocolError);
        }
        log::info!("[VIRTIO-BLK] Shut down");
        Ok(())
    }
}

impl<H: VirtioHal, P: RegisterPort> Drop for VirtioBlk<H, P> {
    fn drop(&mut self) {
        // Device must stop using ring memory before the queue frees it
        if self.state != DriverState::Shutdown {
            if let Err(err) = self.shutdown() {
                log::warn!("[VIRTIO-BLK] Shutdown on drop failed: {err}");
            }
        }
    }
}

impl<H: VirtioHal, P: RegisterPort> core::fmt::Debug for VirtioBlk<H, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtioBlk")
            .field("state", &self.state)
            .field("info", &self.info)
            .field("queue", &self.queue)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

pub(crate) fn backoff(base: u32, attempt: u32) {
    let spins = base.saturating_mul(1 << attempt.min(MAX_BACKOFF_SHIFT));
    for _ in 0..spins {
        core::hint::spin_loop();
    }
}
