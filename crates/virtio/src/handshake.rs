//! Device status handshake.
//!
//! TEAM_452: Extracted from the GPU driver's init sequence and made
//! explicit so every status transition is verified by read-back and the
//! order can't be violated by a caller.
//!
//! ```text
//! Reset -> Acknowledged -> DriverLoaded -> FeaturesNegotiated -> DriverOk
//!   \__________\________________\_________________\______________-> Failed
//! ```

use crate::port::RegisterPort;
use crate::transport::{DeviceType, MmioTransport, TransportError};
use crate::{DeviceStatus, features};

/// Spins allowed for a reset to show up in the status register.
const RESET_POLL_LIMIT: u32 = 1_000_000;

/// Where the driver is in bringing the device up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Status register is zero.
    Reset,
    /// ACKNOWLEDGE confirmed.
    Acknowledged,
    /// DRIVER confirmed.
    DriverLoaded,
    /// FEATURES_OK confirmed; queues may be configured.
    FeaturesNegotiated,
    /// DRIVER_OK confirmed; the device is live.
    DriverOk,
    /// FAILED has been written. Only a reset leaves this state.
    Failed,
}

/// What to do when the device id is not the expected class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTypePolicy {
    /// Refuse the device.
    Strict,
    /// Log a warning and carry on.
    Warn,
}

/// Identification registers read before any write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub version: u32,
    pub device_id: u32,
    pub vendor_id: u32,
}

/// Drives a device's status register from reset to `DRIVER_OK`.
#[derive(Debug)]
pub struct DeviceHandshake {
    state: HandshakeState,
    expected: DeviceType,
    policy: DeviceTypePolicy,
    negotiated: u64,
    queue_ready: bool,
}

impl DeviceHandshake {
    pub fn new(expected: DeviceType, policy: DeviceTypePolicy) -> Self {
        Self {
            state: HandshakeState::Reset,
            expected,
            policy,
            negotiated: 0,
            queue_ready: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Features both sides agreed on, valid from `FeaturesNegotiated` on.
    pub fn negotiated_features(&self) -> u64 {
        self.negotiated
    }

    /// Check magic, version and device id without writing anything.
    pub fn identify<P: RegisterPort>(
        &self,
        transport: &MmioTransport<P>,
    ) -> Result<DeviceIdentity, TransportError> {
        if !transport.has_magic() {
            log::debug!("[VIRTIO] Bad magic {:#x}", transport.magic());
            return Err(TransportError::DeviceNotFound);
        }

        // TEAM_100: Accept both legacy (1) and modern (2) VirtIO MMIO
        let version = transport.version();
        if version == 0 || version > 2 {
            log::warn!("[VIRTIO] Unsupported MMIO version {version}");
            return Err(TransportError::UnsupportedVersion);
        }

        let device_id = transport.device_id();
        if device_id != self.expected as u32 {
            match self.policy {
                DeviceTypePolicy::Strict => {
                    log::warn!(
                        "[VIRTIO] Device id {device_id}, expected {:?}",
                        self.expected
                    );
                    return Err(TransportError::UnexpectedDeviceType);
                }
                DeviceTypePolicy::Warn => {
                    log::warn!(
                        "[VIRTIO] Device id {device_id}, expected {:?}; continuing",
                        self.expected
                    );
                }
            }
        }

        Ok(DeviceIdentity {
            version,
            device_id,
            vendor_id: transport.vendor_id(),
        })
    }

    /// Write zero to status and wait for the device to report it.
    ///
    /// Legal from any state; this is the only way out of `Failed`.
    pub fn reset<P: RegisterPort>(
        &mut self,
        transport: &mut MmioTransport<P>,
    ) -> Result<(), TransportError> {
        transport.write_status(DeviceStatus::empty());
        let mut spins = 0;
        while !transport.read_status().is_empty() {
            spins += 1;
            if spins >= RESET_POLL_LIMIT {
                log::error!("[VIRTIO] Device did not clear status after reset");
                self.state = HandshakeState::Failed;
                return Err(TransportError::ResetTimeout);
            }
            core::hint::spin_loop();
        }
        self.state = HandshakeState::Reset;
        self.negotiated = 0;
        self.queue_ready = false;
        Ok(())
    }

    /// Set ACKNOWLEDGE then DRIVER, each verified.
    pub fn acknowledge<P: RegisterPort>(
        &mut self,
        transport: &mut MmioTransport<P>,
    ) -> Result<(), TransportError> {
        self.require(HandshakeState::Reset)?;
        self.set_status(transport, DeviceStatus::ACKNOWLEDGE)?;
        self.state = HandshakeState::Acknowledged;
        self.set_status(transport, DeviceStatus::DRIVER)?;
        self.state = HandshakeState::DriverLoaded;
        Ok(())
    }

    /// Accept `device & supported`, then confirm FEATURES_OK stuck.
    pub fn negotiate<P: RegisterPort>(
        &mut self,
        transport: &mut MmioTransport<P>,
        supported: u64,
    ) -> Result<u64, TransportError> {
        self.require(HandshakeState::DriverLoaded)?;

        let offered = transport.read_device_features();
        let accepted = offered & supported;
        log::debug!("[VIRTIO] Features offered {offered:#x}, accepted {accepted:#x}");
        if accepted & features::VERSION_1 == 0 {
            log::warn!("[VIRTIO] Device does not offer VERSION_1, running legacy");
        }
        transport.write_driver_features(accepted);

        self.set_status(transport, DeviceStatus::FEATURES_OK)?;
        // Device may clear FEATURES_OK later if it dislikes the subset
        if !transport.read_status().contains(DeviceStatus::FEATURES_OK) {
            log::error!("[VIRTIO] Device rejected features {accepted:#x}");
            self.fail(transport);
            return Err(TransportError::FeaturesRejected);
        }

        self.negotiated = accepted;
        self.state = HandshakeState::FeaturesNegotiated;
        Ok(accepted)
    }

    /// Select `queue` and return the device's maximum size for it.
    pub fn queue_max_size<P: RegisterPort>(
        &mut self,
        transport: &mut MmioTransport<P>,
        queue: u16,
    ) -> Result<u16, TransportError> {
        self.require(HandshakeState::FeaturesNegotiated)?;
        if !transport.select_queue(queue) {
            self.fail(transport);
            return Err(TransportError::QueueSetupFailed);
        }
        let max = transport.max_queue_size();
        if max == 0 {
            log::error!("[VIRTIO] Queue {queue} unavailable");
            self.fail(transport);
            return Err(TransportError::QueueUnavailable);
        }
        Ok(max)
    }

    /// Program size and address of the selected queue and enable it.
    pub fn activate_queue<P: RegisterPort>(
        &mut self,
        transport: &mut MmioTransport<P>,
        size: u16,
        paddr: u64,
    ) -> Result<(), TransportError> {
        self.require(HandshakeState::FeaturesNegotiated)?;
        transport.set_queue_size(size);
        if !transport.set_queue_address(paddr) {
            log::error!("[VIRTIO] Queue address {paddr:#x} not latched");
            self.fail(transport);
            return Err(TransportError::QueueSetupFailed);
        }
        if !transport.enable_queue() {
            log::error!("[VIRTIO] Queue enable not confirmed");
            self.fail(transport);
            return Err(TransportError::QueueSetupFailed);
        }
        self.queue_ready = true;
        Ok(())
    }

    /// Set DRIVER_OK. Requires an activated queue.
    pub fn finalize<P: RegisterPort>(
        &mut self,
        transport: &mut MmioTransport<P>,
    ) -> Result<(), TransportError> {
        self.require(HandshakeState::FeaturesNegotiated)?;
        if !self.queue_ready {
            return Err(TransportError::OutOfOrder);
        }
        self.set_status(transport, DeviceStatus::DRIVER_OK)?;
        self.state = HandshakeState::DriverOk;
        Ok(())
    }

    /// Write FAILED. Reachable from any state.
    pub fn fail<P: RegisterPort>(&mut self, transport: &mut MmioTransport<P>) {
        let current = transport.read_status();
        transport.write_status(current | DeviceStatus::FAILED);
        self.state = HandshakeState::Failed;
    }

    fn require(&self, state: HandshakeState) -> Result<(), TransportError> {
        if self.state == state {
            Ok(())
        } else {
            log::warn!("[VIRTIO] Handshake step needs {state:?}, in {:?}", self.state);
            Err(TransportError::OutOfOrder)
        }
    }

    /// OR `bit` into status and confirm the device kept it.
    fn set_status<P: RegisterPort>(
        &mut self,
        transport: &mut MmioTransport<P>,
        bit: DeviceStatus,
    ) -> Result<(), TransportError> {
        let wanted = transport.read_status() | bit;
        let seen = transport.write_status(wanted);
        if seen.contains(wanted) {
            Ok(())
        } else {
            log::error!("[VIRTIO] Status write {:#x} read back {:#x}", wanted.bits(), seen.bits());
            self.fail(transport);
            Err(TransportError::StatusRejected)
        }
    }
}
