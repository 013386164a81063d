//! Driver configuration.

use los_virtio::DeviceTypePolicy;

use crate::protocol::BlkFeatures;

/// Configuration for the block driver.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// What to do if the device id is not a block device.
    pub device_type_policy: DeviceTypePolicy,
    /// Features offered to the device; the result is the intersection.
    pub requested_features: BlkFeatures,
    /// Upper bound on the queue size regardless of what the device allows.
    pub max_queue_size: u16,
    /// Queue to drive (block devices without MQ have only queue 0).
    pub queue_index: u16,
    /// Poll iterations a blocking call waits before `Timeout`.
    pub poll_budget: u32,
    /// Retries on descriptor exhaustion before giving up.
    pub admission_retries: u32,
    /// Spin count of the first backoff; doubles per retry.
    pub backoff_spins: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device_type_policy: DeviceTypePolicy::Strict,
            requested_features: BlkFeatures::DRIVER_DEFAULT,
            max_queue_size: 128,
            queue_index: 0,
            poll_budget: 1_000_000,
            admission_retries: 8,
            backoff_spins: 64,
        }
    }
}
